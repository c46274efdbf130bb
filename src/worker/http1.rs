//! HTTP/1.1 worker.
//!
//! # Responsibilities
//! - Drive one HTTP/1.1 connection with at most one request in flight
//! - Stream the response into the task, then become idle again
//! - Recycle on `Connection: close` and on idle timeout

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::dispatch::policy::ResponseClass;
use crate::dispatch::task::{Task, TaskState};
use crate::error::{DispatchError, WorkerError};
use crate::net::{ConnectionId, PooledConnection, Protocol};
use crate::worker::base::{wait_closed, WorkerBase};
use crate::worker::{request, Worker, WorkerContext, WorkerStatus};

pub struct Http1Worker {
    base: Arc<WorkerBase>,
    sender: Mutex<SendRequest<Full<Bytes>>>,
}

impl Http1Worker {
    /// Run the HTTP/1.1 handshake over a pooled connection.
    pub async fn start(conn: PooledConnection, ctx: WorkerContext) -> Result<Arc<Self>, WorkerError> {
        let (info, io, lease) = conn.into_parts();
        let max_processed = ctx.config.http1_max_processed;
        let (sender, connection) = http1::handshake(TokioIo::new(io)).await?;
        let base = Arc::new(WorkerBase::new(info, lease, ctx, max_processed));

        let driver_base = Arc::clone(&base);
        tokio::spawn(async move {
            let mut closed = driver_base.closed_signal();
            tokio::select! {
                result = connection => {
                    let reason = match result {
                        Ok(()) => "peer_close",
                        Err(e) => {
                            tracing::debug!(worker = %driver_base.info().id, error = %e, "HTTP/1.1 connection error");
                            "conn_error"
                        }
                    };
                    driver_base.close(reason);
                }
                _ = wait_closed(&mut closed) => {}
            }
        });

        Ok(Arc::new(Self {
            base,
            sender: Mutex::new(sender),
        }))
    }

    async fn run(self: Arc<Self>, mut task: Task) {
        let ctx = self.base.ctx().clone();
        let response_timeout = ctx.config.response_timeout();

        let req = match request::http1(&task) {
            Ok(req) => req.map(|()| Full::new(task.body.clone())),
            Err(e) => {
                self.base.abandon();
                task.fail(DispatchError::InvalidRequest(e.to_string()));
                return;
            }
        };

        let sent_at = Instant::now();
        let result = {
            let mut sender = self.sender.lock().await;
            tokio::time::timeout(response_timeout, async {
                sender.ready().await?;
                sender.send_request(req).await
            })
            .await
        };
        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return self.fail_before_delivery(task, WorkerError::Http1(e)),
            Err(_) => return self.fail_before_delivery(task, WorkerError::Timeout),
        };
        let rtt = sent_at.elapsed();

        let (parts, mut body) = response.into_parts();
        let class = ctx.policy.classify(parts.status, &parts.headers);
        let peer_close = request::wants_close(&parts.headers);
        let Some(tx) = task.deliver(parts.status, parts.headers, self.ip(), Protocol::Http1) else {
            // Unread body left on the wire; the socket cannot be reused.
            self.close("caller_gone");
            self.base.complete(Some(rtt), class);
            return;
        };
        drop(task);

        loop {
            match tokio::time::timeout(response_timeout, body.frame()).await {
                Ok(Some(Ok(frame))) => {
                    let Ok(data) = frame.into_data() else { continue };
                    if tx.send(Ok(data)).await.is_err() {
                        self.close("caller_gone");
                        self.base.complete(Some(rtt), class);
                        return;
                    }
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    let _ = tx.send(Err(DispatchError::Stream(e.to_string()))).await;
                    return self.fail_after_delivery(WorkerError::Http1(e));
                }
                Err(_) => {
                    let _ = tx.send(Err(DispatchError::Stream("body timed out".into()))).await;
                    return self.fail_after_delivery(WorkerError::Timeout);
                }
            }
        }

        // Close first so the completion never advertises a dying worker as idle.
        if peer_close {
            self.close("peer_close");
        }
        self.base.complete(Some(rtt), class);
    }

    fn fail_before_delivery(&self, task: Task, err: WorkerError) {
        tracing::debug!(
            worker = %self.id(),
            ip = %self.ip(),
            task_id = %task.id,
            error = %err,
            "HTTP/1.1 request failed, retrying"
        );
        self.close("request_error");
        self.base.complete(None, ResponseClass::Failure);
        self.base.ctx().queue.retry(task, &err.to_string());
    }

    fn fail_after_delivery(&self, err: WorkerError) {
        tracing::warn!(worker = %self.id(), ip = %self.ip(), error = %err, "Response body failed");
        self.base.close_down_fail();
        self.base.complete(None, ResponseClass::Failure);
    }
}

impl Worker for Http1Worker {
    fn id(&self) -> ConnectionId {
        self.base.info().id
    }

    fn ip(&self) -> IpAddr {
        self.base.info().ip()
    }

    fn protocol(&self) -> Protocol {
        Protocol::Http1
    }

    fn accept_task(&self) -> bool {
        !self.is_closed() && self.outstanding() == 0 && !self.life_end()
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
        let limit = self.base.ctx().config.http1_idle_timeout();
        if self.is_idle() && self.base.idle_for(now) > limit {
            self.close("idle_timeout");
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
