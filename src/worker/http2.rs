//! HTTP/2 worker.
//!
//! # Responsibilities
//! - Multiplex up to `http2_max_streams` tasks over one connection
//! - Keep the connection verified with pings while it is quiet
//! - Close as "ping_timeout" after repeated ping failures or long silence
//!
//! # Design Decisions
//! - Stream resets fail only their own task; connection-level errors close
//!   the worker
//! - The ping loop owns the `PingPong` handle; the connection driver owns
//!   the socket, so closing drops the socket

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use h2::client::SendRequest;
use h2::{Ping, PingPong};
use tokio::time::Instant;

use crate::dispatch::policy::ResponseClass;
use crate::dispatch::task::{Task, TaskState};
use crate::error::{DispatchError, WorkerError};
use crate::net::{ConnectionId, PooledConnection, Protocol};
use crate::worker::base::{wait_closed, WorkerBase};
use crate::worker::{request, Worker, WorkerContext, WorkerStatus};

pub struct Http2Worker {
    base: Arc<WorkerBase>,
    client: SendRequest<Bytes>,
}

impl Http2Worker {
    /// Run the HTTP/2 handshake over a pooled connection.
    pub async fn start(conn: PooledConnection, ctx: WorkerContext) -> Result<Arc<Self>, WorkerError> {
        let (info, io, lease) = conn.into_parts();
        let max_processed = ctx.config.http2_max_processed;
        let (client, mut connection) = h2::client::handshake(io).await?;
        let ping_pong = connection.ping_pong();
        let base = Arc::new(WorkerBase::new(info, lease, ctx, max_processed));

        let driver_base = Arc::clone(&base);
        tokio::spawn(async move {
            let mut closed = driver_base.closed_signal();
            tokio::select! {
                result = connection => {
                    let reason = match result {
                        Ok(()) => "peer_close",
                        Err(e) if e.is_go_away() => "goaway",
                        Err(e) => {
                            tracing::debug!(worker = %driver_base.info().id, error = %e, "HTTP/2 connection error");
                            "conn_error"
                        }
                    };
                    driver_base.close(reason);
                }
                _ = wait_closed(&mut closed) => {}
            }
        });

        if let Some(ping_pong) = ping_pong {
            tokio::spawn(ping_loop(Arc::clone(&base), ping_pong));
        }

        Ok(Arc::new(Self { base, client }))
    }

    async fn run(self: Arc<Self>, mut task: Task) {
        let ctx = self.base.ctx().clone();
        let response_timeout = ctx.config.response_timeout();

        let req = match request::http2(&task) {
            Ok(req) => req,
            Err(e) => {
                self.base.abandon();
                task.fail(DispatchError::InvalidRequest(e.to_string()));
                return;
            }
        };

        let sent_at = Instant::now();
        let body = task.body.clone();
        let client = self.client.clone();
        let result = tokio::time::timeout(response_timeout, async move {
            let mut client = client.ready().await?;
            let (response, mut stream) = client.send_request(req, body.is_empty())?;
            if !body.is_empty() {
                stream.send_data(body, true)?;
            }
            response.await
        })
        .await;

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return self.fail_before_delivery(task, WorkerError::Http2(e)),
            Err(_) => return self.fail_before_delivery(task, WorkerError::Timeout),
        };
        let rtt = sent_at.elapsed();

        let (parts, mut body) = response.into_parts();
        let class = ctx.policy.classify(parts.status, &parts.headers);
        let Some(tx) = task.deliver(parts.status, parts.headers, self.ip(), Protocol::Http2) else {
            // Dropping the stream resets it; the connection stays usable.
            self.base.complete(Some(rtt), class);
            return;
        };
        drop(task);

        loop {
            match tokio::time::timeout(response_timeout, body.data()).await {
                Ok(Some(Ok(chunk))) => {
                    let _ = body.flow_control().release_capacity(chunk.len());
                    if tx.send(Ok(chunk)).await.is_err() {
                        self.base.complete(Some(rtt), class);
                        return;
                    }
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    let _ = tx.send(Err(DispatchError::Stream(e.to_string()))).await;
                    return self.fail_after_delivery(WorkerError::Http2(e));
                }
                Err(_) => {
                    let _ = tx.send(Err(DispatchError::Stream("body timed out".into()))).await;
                    return self.fail_after_delivery(WorkerError::Timeout);
                }
            }
        }

        self.base.complete(Some(rtt), class);
    }

    fn fail_before_delivery(&self, task: Task, err: WorkerError) {
        tracing::debug!(
            worker = %self.id(),
            ip = %self.ip(),
            task_id = %task.id,
            error = %err,
            "HTTP/2 request failed, retrying"
        );
        let stream_only = matches!(&err, WorkerError::Http2(e) if e.is_reset() && !e.is_go_away());
        if !stream_only {
            self.close("request_error");
        }
        self.base.complete(None, ResponseClass::Failure);
        self.base.ctx().queue.retry(task, &err.to_string());
    }

    fn fail_after_delivery(&self, err: WorkerError) {
        tracing::warn!(worker = %self.id(), ip = %self.ip(), error = %err, "Response body failed");
        self.base.close_down_fail();
        self.base.complete(None, ResponseClass::Failure);
    }
}

async fn ping_loop(base: Arc<WorkerBase>, mut ping_pong: PingPong) {
    let config = base.ctx().config.clone();
    let interval = config.ping_interval();
    let mut closed = base.closed_signal();
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wait_closed(&mut closed) => return,
        }
        if base.outstanding() > 0 || base.idle_for(Instant::now()) < interval {
            continue;
        }

        match tokio::time::timeout(config.ping_timeout(), ping_pong.ping(Ping::opaque())).await {
            Ok(Ok(_)) => {
                failures = 0;
                base.mark_ping_ok();
            }
            outcome => {
                failures += 1;
                let error = match outcome {
                    Ok(Err(e)) => e.to_string(),
                    _ => "timed out".to_string(),
                };
                tracing::debug!(
                    worker = %base.info().id,
                    ip = %base.info().ip(),
                    failures,
                    error = %error,
                    "Ping failed"
                );
                if failures >= config.max_ping_failures {
                    base.close("ping_timeout");
                    return;
                }
            }
        }
    }
}

impl Worker for Http2Worker {
    fn id(&self) -> ConnectionId {
        self.base.info().id
    }

    fn ip(&self) -> IpAddr {
        self.base.info().ip()
    }

    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    fn accept_task(&self) -> bool {
        !self.is_closed()
            && self.outstanding() < self.base.ctx().config.http2_max_streams
            && !self.life_end()
    }

    fn outstanding(&self) -> usize {
        self.base.outstanding()
    }

    fn score(&self) -> u64 {
        self.base.score()
    }

    fn processed(&self) -> u64 {
        self.base.processed()
    }

    fn life_end(&self) -> bool {
        self.base.life_end()
    }

    fn check_active(&self, now: Instant) {
        let dead_after = self.base.ctx().config.dead_after();
        if self.is_idle() && self.base.silent_for(now) > dead_after {
            self.close("ping_timeout");
        }
    }

    fn request(self: Arc<Self>, mut task: Task) {
        self.base.begin_task();
        task.worker_ip = Some(self.ip());
        task.set_state(TaskState::Assigned, format!("{} {}", self.id(), self.ip()));
        tokio::spawn(self.run(task));
    }

    fn close(&self, reason: &str) {
        self.base.close(reason);
    }

    fn is_closed(&self) -> bool {
        self.base.is_closed()
    }

    fn status(&self) -> WorkerStatus {
        self.base.status(self.accept_task())
    }
}
