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

use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    config::{TelemetryConfig, TelemetryMode},
    proxy::flow::Exchange,
};

/// Emits one summary event per relayed exchange, through `tracing` or as JSON lines.
#[derive(Clone)]
pub struct TelemetrySink {
    mode: TelemetryMode,
}

impl TelemetrySink {
    pub fn new(cfg: TelemetryConfig) -> Self {
        Self { mode: cfg.mode }
    }

    pub fn emit(&self, event: &str, exchange_id: Uuid, payload: Value) {
        match self.mode {
            TelemetryMode::Stdout => {
                tracing::info!(%exchange_id, event, payload = %payload);
            }
            TelemetryMode::Json => {
                let data = json!({
                    "event": event,
                    "exchange_id": exchange_id,
                    "payload": payload,
                });
                println!("{}", data);
            }
        }
    }

    pub fn record_exchange(&self, exchange: &Exchange) {
        self.emit("exchange", exchange.id, exchange_payload(exchange));
    }
}

fn exchange_payload(exchange: &Exchange) -> Value {
    let meta = &exchange.metadata;
    json!({
        "peer": meta.peer.map(|peer| peer.to_string()),
        "sni": meta.tls_sni,
        "method": exchange.request.method.as_str(),
        "target": exchange.target.as_ref().map(|target| target.pool_key()),
        "path": exchange.request.path_and_query(),
        "status": exchange.response.as_ref().map(|response| response.status.as_u16()),
        "client_protocol": meta.client_protocol,
        "upstream_protocol": meta.upstream_protocol,
        "matched_hooks": meta.matched_hooks,
        "intercepted": meta.intercepted,
        "faked": meta.faked,
        "control": meta.control,
        "error": meta.error,
    })
}
