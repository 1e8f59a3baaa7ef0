//! Dashboard pages built on [`Session`].
//!
//! Activating a page binds its response events, joins the Slurm broadcast
//! room, starts its polling cycle (immediate, paused while hidden), and arms
//! a reconnect refresh. Every response arrives on the page's update channel
//! as a [`PageUpdate`]. Dropping the [`Page`] tears its session down.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{DashError, Result};
use crate::events;
use crate::requests;
use crate::session::{PollHandle, PollOptions, Session};
use crate::visibility::Visibility;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageKind {
    Dashboard,
    Jobs,
    Resources,
    JobDetails { job_id: String },
    Notifications,
}

impl fmt::Display for PageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageKind::Dashboard => write!(f, "dashboard"),
            PageKind::Jobs => write!(f, "jobs"),
            PageKind::Resources => write!(f, "resources"),
            PageKind::JobDetails { job_id } => write!(f, "job-{}", job_id),
            PageKind::Notifications => write!(f, "notifications"),
        }
    }
}

/// What a page listens to, what it asks for, and how often.
#[derive(Debug, Clone, PartialEq)]
pub struct PagePlan {
    pub listens: Vec<&'static str>,
    pub requests: Vec<(&'static str, Value)>,
    pub poll_every: Option<Duration>,
}

impl PageKind {
    pub fn plan(&self, config: &ClientConfig) -> PagePlan {
        let every = |ms: u64| Some(Duration::from_millis(ms));
        match self {
            PageKind::Dashboard => PagePlan {
                listens: vec![
                    events::STATS_LIST,
                    events::JOBS_LIST,
                    events::METRICS_STATISTICS,
                    events::NEW_METRIC_POINT,
                ],
                requests: vec![
                    (events::GET_STATS, Value::Null),
                    (events::GET_JOBS, Value::Null),
                    (events::GET_METRICS_STATISTICS, requests::metrics_statistics(24)),
                ],
                poll_every: every(config.poll.dashboard_ms),
            },
            PageKind::Jobs => PagePlan {
                listens: vec![events::JOBS_LIST, events::CANCEL_RESULT],
                requests: vec![(events::GET_JOBS, Value::Null)],
                poll_every: every(config.poll.jobs_ms),
            },
            PageKind::Resources => PagePlan {
                listens: vec![events::RESOURCES_LIST, events::PARTITIONS_LIST],
                requests: vec![
                    (events::GET_RESOURCES, Value::Null),
                    (events::GET_PARTITIONS, Value::Null),
                ],
                poll_every: every(config.poll.resources_ms),
            },
            PageKind::JobDetails { job_id } => PagePlan {
                listens: vec![events::JOB_DETAILS, events::JOB_OUTPUT],
                requests: vec![
                    (events::GET_JOB, requests::job_id(job_id)),
                    (events::GET_JOB_OUTPUT, requests::job_output(job_id, None)),
                ],
                poll_every: every(config.poll.job_details_ms),
            },
            PageKind::Notifications => PagePlan {
                listens: vec![
                    events::NEW_JOB_NOTIFICATION,
                    events::JOB_SUBMITTED,
                    events::JOB_CANCELLED,
                ],
                requests: Vec::new(),
                poll_every: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PageOutcome {
    Data(Value),
    /// The server answered with `success: false` or an `error` event.
    Failed(String),
    /// The shared connection reported `disconnect` or `connect_error`.
    ConnectionLost(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct PageUpdate {
    pub page: String,
    pub event: String,
    pub outcome: PageOutcome,
    pub received_at: DateTime<Utc>,
}

/// An active page. Dropping it releases its session.
pub struct Page {
    kind: PageKind,
    session: Session,
    poll: Option<PollHandle>,
    refresh: Arc<dyn Fn() + Send + Sync>,
}

impl Page {
    /// Activate `kind` on the shared connection.
    ///
    /// Fails with [`DashError::ConnectionUnavailable`] when the connection is
    /// closed; callers abandon the page in that case.
    pub fn activate(
        kind: PageKind,
        conn: Connection,
        visibility: Visibility,
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PageUpdate>)> {
        if conn.is_closed() {
            tracing::error!(page = %kind, "Cannot activate page without a connection");
            return Err(DashError::ConnectionUnavailable);
        }

        let plan = kind.plan(config);
        let session = Session::new(kind.to_string(), conn.clone(), visibility);
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        let forwarded = plan.listens.iter().copied().chain([
            events::ERROR,
            events::DISCONNECT,
            events::CONNECT_ERROR,
        ]);
        for event in forwarded {
            let tx = update_tx.clone();
            let page = kind.to_string();
            session.on(event, move |payload: &Value| {
                let update = PageUpdate {
                    page: page.clone(),
                    event: event.to_string(),
                    outcome: outcome_for(event, payload),
                    received_at: Utc::now(),
                };
                if tx.send(update).is_err() {
                    tracing::debug!(page = %page, event, "Page consumer gone, dropping update");
                }
            });
        }

        let join_conn = conn.clone();
        session.emit_when_ready(move || join_conn.emit(events::JOIN_SLURM_ROOM, Value::Null));

        let requests = plan.requests.clone();
        let request_conn = conn.clone();
        let refresh: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            for (event, payload) in &requests {
                request_conn.emit(event, payload.clone());
            }
        });

        let poll = match plan.poll_every {
            Some(period) => {
                let tick = refresh.clone();
                session.poll(period, move || tick(), PollOptions::default())
            }
            None => {
                if !plan.requests.is_empty() {
                    let once = refresh.clone();
                    session.emit_when_ready(move || once());
                }
                None
            }
        };

        // Rooms do not survive a reconnect, so rejoin before refreshing.
        let rejoin_conn = conn;
        let reconnect_refresh = refresh.clone();
        session.on_reconnect(move || {
            rejoin_conn.emit(events::JOIN_SLURM_ROOM, Value::Null);
            reconnect_refresh();
        });

        session.mark_started();
        tracing::info!(page = %kind, listens = plan.listens.len(), "Page activated");

        Ok((
            Self {
                kind,
                session,
                poll,
                refresh,
            },
            update_rx,
        ))
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Re-issue the page's requests now, outside the polling cycle.
    pub fn refresh(&self) {
        (self.refresh)();
    }

    /// Stop the polling cycle while keeping event bindings.
    pub fn stop_polling(&mut self) -> bool {
        match self.poll.take() {
            Some(handle) => self.session.stop_poll(handle),
            None => false,
        }
    }
}

fn outcome_for(event: &str, payload: &Value) -> PageOutcome {
    if events::is_lifecycle(event) {
        let reason = payload
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| payload.to_string());
        return PageOutcome::ConnectionLost(reason);
    }
    if event == events::ERROR {
        return PageOutcome::Failed(events::failure_message(payload));
    }
    match events::check_response(payload) {
        Ok(data) => PageOutcome::Data(data.clone()),
        Err(DashError::Server(message)) => PageOutcome::Failed(message),
        Err(e) => PageOutcome::Failed(e.to_string()),
    }
}
