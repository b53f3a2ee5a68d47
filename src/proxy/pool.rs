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

//! Pooled HTTP/2 client sessions keyed by upstream authority, plus the memo of which
//! authorities turned out not to speak HTTP/2.

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use h2::client::{ResponseFuture, SendRequest};
use http::{HeaderMap, Method, Request, Uri, Version};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};

use crate::{
    proxy::{
        client::{negotiated_alpn, AlpnOffer, UpstreamConnector},
        flow::Target,
    },
    tls::resolver::ALPN_H2,
    utils::{ProxyError, ProxyResult},
};

/// Remembers, per authority URL, whether the server negotiated HTTP/2.
///
/// Entries expire after `ttl`; once `capacity` is reached the oldest record is evicted.
pub struct ProtocolMemo {
    entries: Mutex<LruCache<String, MemoEntry>>,
    ttl: Duration,
}

#[derive(Debug, Clone, Copy)]
struct MemoEntry {
    supports_h2: bool,
    recorded: Instant,
}

impl ProtocolMemo {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn record(&self, authority: &str, supports_h2: bool) {
        let entry = MemoEntry {
            supports_h2,
            recorded: Instant::now(),
        };
        if let Some((evicted, _)) = self.entries.lock().push(authority.to_string(), entry) {
            if evicted != authority {
                tracing::trace!(%evicted, "protocol memo full, evicted oldest entry");
            }
        }
    }

    /// `None` when the authority was never probed or its record expired.
    pub fn supports_h2(&self, authority: &str) -> Option<bool> {
        let mut entries = self.entries.lock();
        let entry = *entries.peek(authority)?;
        if entry.recorded.elapsed() >= self.ttl {
            entries.pop(authority);
            return None;
        }
        Some(entry.supports_h2)
    }

    /// True only for authorities known to lack HTTP/2.
    pub fn is_http1_only(&self, authority: &str) -> bool {
        self.supports_h2(authority) == Some(false)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A live multiplexed session. Clones share the same connection.
#[derive(Debug, Clone)]
pub struct H2Session {
    id: u64,
    authority: String,
    sender: SendRequest<Bytes>,
    activity: Arc<SessionActivity>,
}

impl H2Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }
}

#[derive(Debug)]
struct SessionActivity {
    active: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl SessionActivity {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            last_used: Mutex::new(Instant::now()),
        }
    }

    /// `None` once the session has been idle for `timeout`, else the next check time.
    fn next_idle_check(&self, timeout: Duration) -> Option<Instant> {
        let now = Instant::now();
        if self.active.load(Ordering::Acquire) > 0 {
            return Some(now + timeout);
        }
        let deadline = *self.last_used.lock() + timeout;
        (deadline > now).then_some(deadline)
    }
}

/// Keeps a session marked busy while one stream on it is in use.
pub struct StreamLease {
    activity: Arc<SessionActivity>,
}

impl StreamLease {
    fn new(activity: Arc<SessionActivity>) -> Self {
        activity.active.fetch_add(1, Ordering::AcqRel);
        Self { activity }
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        *self.activity.last_used.lock() = Instant::now();
        self.activity.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A request stream opened on a pooled session.
pub struct H2Stream {
    pub response: ResponseFuture,
    pub body: h2::SendStream<Bytes>,
    pub lease: StreamLease,
    pub session_id: u64,
}

type PendingConnect = watch::Receiver<Option<ProxyResult<H2Session>>>;

/// HTTP/2 session pool with one in-flight connect per authority.
pub struct H2SessionPool {
    connector: UpstreamConnector,
    memo: Arc<ProtocolMemo>,
    open: DashMap<String, H2Session>,
    pending: DashMap<String, PendingConnect>,
    next_id: AtomicU64,
    connect_attempts: AtomicU64,
    idle_timeout: Duration,
}

impl H2SessionPool {
    pub fn new(connector: UpstreamConnector, memo: Arc<ProtocolMemo>, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            connector,
            memo,
            open: DashMap::new(),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            connect_attempts: AtomicU64::new(0),
            idle_timeout,
        })
    }

    pub fn memo(&self) -> &Arc<ProtocolMemo> {
        &self.memo
    }

    pub fn connector(&self) -> &UpstreamConnector {
        &self.connector
    }

    /// Number of outbound connections started since the pool was created.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn open_sessions(&self) -> usize {
        self.open.len()
    }

    pub fn has_session(&self, target: &Target) -> bool {
        self.open.contains_key(&target.pool_key())
    }

    /// Records that `target` refused HTTP/2 and drops any session it still has.
    pub fn mark_http1_only(&self, target: &Target) {
        let key = target.pool_key();
        self.memo.record(&key, false);
        self.open.remove(&key);
    }

    /// Unverified ALPN probe; the outcome is memoised.
    pub async fn probe(&self, target: &Target) -> ProxyResult<bool> {
        let supports_h2 = self.connector.probe_h2(target).await?;
        self.memo.record(&target.pool_key(), supports_h2);
        tracing::debug!(authority = %target.pool_key(), supports_h2, "ALPN probe finished");
        Ok(supports_h2)
    }

    /// Returns the open session for `target`, connecting if there is none.
    ///
    /// Concurrent callers for the same authority share one connect attempt and all
    /// receive its session or its error.
    pub async fn get_or_create(self: &Arc<Self>, target: &Target) -> ProxyResult<H2Session> {
        let key = target.pool_key();
        if self.memo.is_http1_only(&key) {
            return Err(ProxyError::DowngradeRequired { authority: key });
        }
        if let Some(session) = self.open.get(&key) {
            return Ok(session.clone());
        }

        let mut rx = match self.pending.entry(key.clone()) {
            Entry::Occupied(occ) => occ.get().clone(),
            Entry::Vacant(vac) => {
                if let Some(session) = self.open.get(&key) {
                    return Ok(session.clone());
                }
                let (tx, rx) = watch::channel(None);
                vac.insert(rx.clone());

                let pool = Arc::clone(self);
                let target = target.clone();
                tokio::spawn(async move {
                    let result = pool.connect(&target).await;
                    let key = target.pool_key();
                    if let Ok(session) = &result {
                        pool.open.insert(key.clone(), session.clone());
                    }
                    pool.pending.remove(&key);
                    let _ = tx.send(Some(result));
                });
                rx
            }
        };

        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(ProxyError::Connect {
                    target: key,
                    reason: "connect task ended without a result".into(),
                });
            }
        }
    }

    async fn connect(self: &Arc<Self>, target: &Target) -> ProxyResult<H2Session> {
        let key = target.pool_key();
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(authority = %key, "opening HTTP/2 session");

        let tls = self.connector.connect_tls(target, AlpnOffer::Any).await?;
        if negotiated_alpn(&tls).as_deref() != Some(ALPN_H2) {
            tracing::info!(authority = %key, "upstream did not negotiate h2, memoising HTTP/1.1");
            self.memo.record(&key, false);
            return Err(ProxyError::DowngradeRequired { authority: key });
        }
        self.memo.record(&key, true);

        let (sender, connection) = h2::client::handshake(tls).await?;
        let session = H2Session {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            authority: key,
            sender,
            activity: Arc::new(SessionActivity::new()),
        };

        let pool = Arc::downgrade(self);
        let driver_session = session.clone();
        let idle_timeout = self.idle_timeout;
        tokio::spawn(async move {
            drive_session(connection, &driver_session, idle_timeout).await;
            if let Some(pool) = pool.upgrade() {
                pool.discard(&driver_session.authority, driver_session.id);
            }
        });

        Ok(session)
    }

    fn discard(&self, authority: &str, id: u64) {
        if self.open.remove_if(authority, |_, session| session.id == id).is_some() {
            tracing::debug!(%authority, session = id, "HTTP/2 session removed from pool");
        }
    }

    /// Opens a request stream to `target`, retrying once on a fresh session if the
    /// pooled one turns out to be dead.
    pub async fn send_request(
        self: &Arc<Self>,
        target: &Target,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        end_of_stream: bool,
    ) -> ProxyResult<H2Stream> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let session = self.get_or_create(target).await?;
            let lease = StreamLease::new(session.activity.clone());

            let outcome = match session.sender.clone().ready().await {
                Ok(mut sender) => {
                    let request = build_request(method, uri, headers)?;
                    sender.send_request(request, end_of_stream)
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok((response, body)) => {
                    return Ok(H2Stream {
                        response,
                        body,
                        lease,
                        session_id: session.id,
                    })
                }
                Err(err) if attempt < 2 && (err.is_go_away() || err.is_io() || err.is_library()) => {
                    tracing::debug!(authority = %session.authority, "pooled session unusable, reconnecting: {err}");
                    self.discard(&session.authority, session.id);
                }
                Err(err) => {
                    self.discard(&session.authority, session.id);
                    return Err(err.into());
                }
            }
        }
    }
}

async fn drive_session<T>(
    connection: h2::client::Connection<T, Bytes>,
    session: &H2Session,
    idle_timeout: Duration,
) where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    tokio::pin!(connection);
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            result = &mut connection => {
                match result {
                    Ok(()) => tracing::debug!(authority = %session.authority, session = session.id, "HTTP/2 session closed"),
                    Err(err) => tracing::debug!(authority = %session.authority, session = session.id, "HTTP/2 session ended: {err}"),
                }
                return;
            }
            _ = &mut idle => {
                match session.activity.next_idle_check(idle_timeout) {
                    Some(next) => idle.as_mut().reset(next),
                    None => {
                        tracing::debug!(authority = %session.authority, session = session.id, "closing idle HTTP/2 session");
                        return;
                    }
                }
            }
        }
    }
}

fn build_request(method: &Method, uri: &Uri, headers: &HeaderMap) -> ProxyResult<Request<()>> {
    let mut request = Request::builder()
        .method(method.clone())
        .uri(uri.clone())
        .version(Version::HTTP_2)
        .body(())?;
    *request.headers_mut() = headers.clone();
    Ok(request)
}
