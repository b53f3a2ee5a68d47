/* MITM Gateway (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::{
    config::GatewayConfig,
    proxy::{hooks::Hook, GatewayHandle, HookRegistry, LocalServer},
    telemetry::TelemetrySink,
    tls::CertificateStore,
};

/// GatewayApp wires configuration, the certificate store, hooks, and the local
/// server together.
///
/// Initialization order:
/// 1. Telemetry, so later steps can report.
/// 2. CertificateStore: loads or generates the CA before anything can accept TLS.
/// 3. HookRegistry: config rules first, then hooks supplied by the embedding code.
/// 4. LocalServer: binds both listeners.
pub struct GatewayApp {
    server: LocalServer,
    certs: Arc<CertificateStore>,
}

impl GatewayApp {
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        Self::with_hooks(config, Vec::new()).await
    }

    /// Like [`GatewayApp::new`], registering `extra` after the configured rule hooks.
    pub async fn with_hooks(config: GatewayConfig, extra: Vec<Arc<dyn Hook>>) -> Result<Self> {
        let telemetry = TelemetrySink::new(config.telemetry.clone());

        // RSA generation is slow enough to keep off the runtime threads.
        let tls_cfg = config.tls.clone();
        let certs = tokio::task::spawn_blocking(move || CertificateStore::load_or_create(&tls_cfg))
            .await
            .context("certificate store initialisation panicked")??;
        let certs = Arc::new(certs);

        let hooks = HookRegistry::from_config(&config.hooks, extra)?;
        tracing::info!(hooks = hooks.len(), "hook registry ready");

        let server = LocalServer::bind(&config, certs.clone(), hooks, telemetry).await?;
        Ok(Self { server, certs })
    }

    pub fn handle(&self) -> GatewayHandle {
        self.server.handle()
    }

    pub fn certificates(&self) -> &Arc<CertificateStore> {
        &self.certs
    }

    /// Serves until the process exits.
    pub async fn run(self) -> Result<()> {
        self.server.run().await
    }
}
