//! Intake endpoints: enqueue a seed login, inspect a job, and a shallow
//! queue overview. All write paths go through the crawl queue's dedup logic;
//! the API never touches entities or edges directly.

use std::sync::{Arc, OnceLock};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use sponsorgraph_common::{CrawlJob, EnqueueOutcome, JobState};

use crate::AppState;

#[derive(Deserialize)]
pub struct EnqueueRequest {
    pub username: String,
}

/// GitHub login shape: 1-39 alphanumeric or hyphen characters. Anything
/// else is rejected before it can reach a query or an upstream URL.
pub fn valid_login(login: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9-]{1,39}$").expect("login pattern"));
    re.is_match(login)
}

pub async fn api_enqueue(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnqueueRequest>,
) -> impl IntoResponse {
    let login = body.username.trim();
    if !valid_login(login) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid login: expected 1-39 alphanumeric or hyphen characters"})),
        )
            .into_response();
    }

    match state.queue.enqueue_seed(login, chrono::Utc::now()).await {
        Ok(EnqueueOutcome::Queued { job_id }) => {
            info!(login, %job_id, "Seed accepted");
            (StatusCode::ACCEPTED, Json(json!({"job_id": job_id}))).into_response()
        }
        Ok(EnqueueOutcome::Duplicate { job_id }) => (
            StatusCode::CONFLICT,
            Json(json!({"error": "a live job for this login already exists", "job_id": job_id})),
        )
            .into_response(),
        Err(err) => {
            error!(login, error = %err, "Enqueue failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "enqueue failed"})),
            )
                .into_response()
        }
    }
}

pub async fn api_job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.queue.job(id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job_json(&job))).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "no such job"})),
        )
            .into_response(),
        Err(err) => {
            error!(%id, error = %err, "Job lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "job lookup failed"})),
            )
                .into_response()
        }
    }
}

/// Most recent jobs plus state counts over that window.
pub async fn api_queue_overview(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let jobs = match state.queue.store().list_jobs(100).await {
        Ok(jobs) => jobs,
        Err(err) => {
            error!(error = %err, "Queue listing failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "queue listing failed"})),
            )
                .into_response();
        }
    };

    let count = |wanted: JobState| jobs.iter().filter(|j| j.state == wanted).count();
    let body = json!({
        "counts": {
            "pending": count(JobState::Pending),
            "in_progress": count(JobState::InProgress),
            "done": count(JobState::Done),
            "failed": count(JobState::Failed),
        },
        "jobs": jobs.iter().map(job_json).collect::<Vec<_>>(),
    });
    (StatusCode::OK, Json(body)).into_response()
}

fn job_json(job: &CrawlJob) -> serde_json::Value {
    json!({
        "id": job.id,
        "login": job.login,
        "github_id": job.github_id,
        "state": job.state.as_str(),
        "depth": job.depth,
        "priority": job.priority,
        "attempts": job.attempts,
        "next_eligible_at": job.next_eligible_at,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
        "last_error": job.last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sponsorgraph_crawler::testing::MemoryStore;
    use sponsorgraph_crawler::{JobQueue, QueuePolicy};

    fn state() -> Arc<AppState> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(AppState {
            queue: JobQueue::new(store, QueuePolicy::default()),
        })
    }

    #[test]
    fn login_validation() {
        assert!(valid_login("octocat"));
        assert!(valid_login("rails-bot"));
        assert!(valid_login("a"));
        assert!(valid_login(&"x".repeat(39)));

        assert!(!valid_login(""));
        assert!(!valid_login(&"x".repeat(40)));
        assert!(!valid_login("bad name"));
        assert!(!valid_login("semi;colon"));
        assert!(!valid_login("dot.dot"));
    }

    #[tokio::test]
    async fn enqueue_accepts_new_login() {
        let state = state();
        let resp = api_enqueue(
            State(state.clone()),
            Json(EnqueueRequest {
                username: "Octocat".into(),
            }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let job = state.queue.job_by_login("octocat").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.depth, 0);
    }

    #[tokio::test]
    async fn enqueue_duplicate_conflicts() {
        let state = state();
        let first = api_enqueue(
            State(state.clone()),
            Json(EnqueueRequest {
                username: "octocat".into(),
            }),
        )
        .await
        .into_response();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        // Case-insensitive duplicate.
        let second = api_enqueue(
            State(state),
            Json(EnqueueRequest {
                username: "OCTOCAT".into(),
            }),
        )
        .await
        .into_response();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn enqueue_rejects_malformed_login() {
        let state = state();
        for login in ["", "not a login", "inject'); --"] {
            let resp = api_enqueue(
                State(state.clone()),
                Json(EnqueueRequest {
                    username: login.into(),
                }),
            )
            .await
            .into_response();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "login {login:?}");
        }
        assert_eq!(state.queue.store().list_jobs(10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn job_status_round_trips() {
        let state = state();
        let outcome = state
            .queue
            .enqueue_seed("octocat", chrono::Utc::now())
            .await
            .unwrap();

        let found = api_job_status(State(state.clone()), Path(outcome.job_id()))
            .await
            .into_response();
        assert_eq!(found.status(), StatusCode::OK);

        let missing = api_job_status(State(state), Path(Uuid::new_v4()))
            .await
            .into_response();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn queue_overview_reports_counts() {
        let state = state();
        state
            .queue
            .enqueue_seed("octocat", chrono::Utc::now())
            .await
            .unwrap();
        let resp = api_queue_overview(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
