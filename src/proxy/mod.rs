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

/// Local MITM server, upstream connections, and the hook protocol.
pub mod body;
pub mod client;
pub mod connection;
pub mod exchange;
pub mod flow;
pub mod hooks;
pub mod http1;
pub mod oneshot;
pub mod pool;
pub mod server;

pub use body::{decode_body, HookBody};
pub use client::{SelfAddresses, UpstreamConnector};
pub use hooks::{Decision, FakeResponse, Hook, HookRegistry, HookRequest, HookResponse, RequestReplacement};
pub use oneshot::{Http2RequestClient, OneShotResponse};
pub use pool::{H2SessionPool, ProtocolMemo};
pub use server::{GatewayHandle, LocalServer};
