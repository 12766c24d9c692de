// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TLS selection for the polling session's reqwest client.

use crate::errors::PollError;
use reqwest::ClientBuilder;
#[cfg(feature = "fips")]
use tracing::debug;

/// Installs the process-wide crypto provider. A no-op outside FIPS builds.
#[cfg(not(feature = "fips"))]
#[allow(clippy::unnecessary_wraps)]
pub fn prepare_client_provider() -> Result<(), PollError> {
    Ok(())
}

/// Installs the AWS-LC FIPS provider as the process-wide rustls default.
#[cfg(feature = "fips")]
pub fn prepare_client_provider() -> Result<(), PollError> {
    rustls::crypto::default_fips_provider()
        .install_default()
        .map_err(|_| tls_error("a crypto provider is already installed"))
}

/// Returns a client builder using reqwest's bundled rustls stack.
#[cfg(not(feature = "fips"))]
pub fn client_builder() -> Result<ClientBuilder, PollError> {
    Ok(reqwest::Client::builder().use_rustls_tls())
}

/// Returns a client builder pinned to the process-wide FIPS crypto provider and the
/// platform's native trust roots.
///
/// The provider must have been installed at startup with [`prepare_client_provider`].
#[cfg(feature = "fips")]
pub fn client_builder() -> Result<ClientBuilder, PollError> {
    let provider = rustls::crypto::CryptoProvider::get_default()
        .ok_or_else(|| tls_error("no crypto provider installed"))?;
    if !provider.fips() {
        return Err(tls_error("installed crypto provider is not FIPS-compliant"));
    }

    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    if ignored > 0 {
        debug!("Ignored {ignored} unparsable native root certificates");
    }
    if added == 0 {
        return Err(tls_error("no usable certificates in the native root store"));
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(|e| tls_error(&e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    if !config.fips() {
        return Err(tls_error("resulting TLS configuration is not FIPS-compliant"));
    }

    Ok(reqwest::Client::builder().use_preconfigured_tls(config))
}

#[cfg(feature = "fips")]
fn tls_error(reason: &str) -> PollError {
    PollError::Connection(format!("TLS setup failed: {reason}"))
}
