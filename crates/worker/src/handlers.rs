use pgjobs::jobs::context::{HandlerError, JobContext};
use pgjobs::jobs::maintenance::{self, REMOVE_OLD_JOBS};
use pgjobs::jobs::registry::{boxed, HandlerFuture, JobKind, JobRegistry};
use serde::Deserialize;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;

/// Job types this worker build knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppJob {
    RemoveOldJobs,
    Heartbeat,
    SendWelcomeEmail,
}

impl JobKind for AppJob {
    fn as_str(&self) -> &'static str {
        match self {
            AppJob::RemoveOldJobs => REMOVE_OLD_JOBS,
            AppJob::Heartbeat => "heartbeat",
            AppJob::SendWelcomeEmail => "sendWelcomeEmail",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            REMOVE_OLD_JOBS => Some(AppJob::RemoveOldJobs),
            "heartbeat" => Some(AppJob::Heartbeat),
            "sendWelcomeEmail" => Some(AppJob::SendWelcomeEmail),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct WelcomeEmailPayload {
    email: String,
    template: Option<String>,
}

fn with_timeout(dur: Duration, fut: HandlerFuture) -> HandlerFuture {
    boxed(async move {
        match timeout(dur, fut).await {
            Ok(inner) => inner,
            Err(_) => Err(HandlerError::new(
                "TIMEOUT",
                format!("handler timeout after {}ms", dur.as_millis()),
            )),
        }
    })
}

fn heartbeat(ctx: JobContext) -> HandlerFuture {
    boxed(async move {
        ctx.log.info("heartbeat");
        Ok(json!({ "worker_id": ctx.worker_id }))
    })
}

fn send_welcome_email(ctx: JobContext) -> HandlerFuture {
    with_timeout(
        Duration::from_secs(10),
        boxed(async move {
            let payload: WelcomeEmailPayload = ctx.payload()?;
            if !payload.email.contains('@') {
                return Err(HandlerError::bad_payload(format!(
                    "not an email address: {}",
                    payload.email
                )));
            }
            let template = payload.template.unwrap_or_else(|| "welcome".to_string());

            ctx.log.info(&format!("welcome email queued for owner {}", ctx.job.owner_id));
            Ok(json!({ "to": payload.email, "template": template }))
        }),
    )
}

pub fn build_registry() -> Arc<JobRegistry<AppJob>> {
    let mut registry = JobRegistry::new();

    registry
        .register(AppJob::RemoveOldJobs, maintenance::remove_old_jobs)
        .register(AppJob::Heartbeat, heartbeat)
        .register(AppJob::SendWelcomeEmail, send_welcome_email);

    Arc::new(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_round_trips_and_has_a_handler() {
        let registry = build_registry();
        for kind in [AppJob::RemoveOldJobs, AppJob::Heartbeat, AppJob::SendWelcomeEmail] {
            assert_eq!(AppJob::parse(kind.as_str()), Some(kind));
            assert!(registry.contains(kind));
        }
        assert_eq!(AppJob::parse("nope"), None);
    }
}
