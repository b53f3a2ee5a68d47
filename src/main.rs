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

use std::path::PathBuf;

use clap::Parser;
use mitm_gateway::{app::GatewayApp, config::GatewayConfig, tls::CertificateStore, utils::init_tracing};

/// Command-line interface.
///
/// Listen addresses, CA paths, upstream settings, and hook rules all live in TOML;
/// the flags only pick the file, the log format, and one-off CA maintenance.
#[derive(Debug, Parser)]
#[command(
    name = "mitm-gateway",
    about = "TLS-terminating HTTP/1.1 + HTTP/2 interception gateway"
)]
struct Cli {
    /// Path to the gateway configuration file (TOML).
    #[arg(short, long, default_value = "config/gateway.example.toml")]
    config: PathBuf,

    /// Enable JSON-formatted logs.
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Delete the persisted CA before starting so a fresh root is generated.
    #[arg(long, default_value_t = false)]
    reset_ca: bool,

    /// Print the CA certificate PEM and its legacy subject hash, then exit.
    #[arg(long, default_value_t = false)]
    ca_info: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = GatewayConfig::load(&cli.config)?;

    if cli.reset_ca {
        CertificateStore::reset(&config.tls)?;
    }

    if cli.ca_info {
        let store = CertificateStore::load_or_create(&config.tls)?;
        println!("{}", store.ca_cert_pem().trim_end());
        println!("subject_hash_old: {}", store.ca_subject_hash()?);
        return Ok(());
    }

    let app = GatewayApp::new(config).await?;
    let handle = app.handle();
    tracing::info!(
        primary = %handle.primary_addr(),
        http1 = %handle.http1_addr(),
        "gateway ready"
    );
    app.run().await
}
