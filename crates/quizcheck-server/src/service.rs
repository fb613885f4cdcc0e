//! The `checker.Checker` gRPC service.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use quizcheck::{CheckRequest, CheckResult, Grader, RequestLimits, Score, Status};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response};
use tracing::Instrument;
use uuid::Uuid;

use crate::admission::Admission;
use crate::proto;
use crate::proto::checker_server::{Checker, CheckerServer};

/// Room for protobuf framing on top of the id and source limits.
const MESSAGE_OVERHEAD_BYTES: usize = 1024;

/// Request handler: validation, admission, then one grading session per request.
#[derive(Debug, Clone)]
pub struct CheckerService {
    grader: Grader,
    admission: Arc<Admission>,
    limits: RequestLimits,
}

impl CheckerService {
    /// Create the service.
    #[must_use]
    pub fn new(grader: Grader, admission: Arc<Admission>, limits: RequestLimits) -> Self {
        Self {
            grader,
            admission,
            limits,
        }
    }

    /// Wrap the service for a tonic router, capping decoded message size.
    #[must_use]
    pub fn into_server(self) -> CheckerServer<Self> {
        let max_message = self
            .limits
            .max_id_bytes
            .saturating_add(self.limits.max_source_bytes)
            .saturating_add(MESSAGE_OVERHEAD_BYTES);
        CheckerServer::new(self).max_decoding_message_size(max_message)
    }

    /// The admission limiter.
    #[must_use]
    pub fn admission(&self) -> &Arc<Admission> {
        &self.admission
    }

    /// Grade a validated request on its own task.
    ///
    /// Rejections become [`Status::Overloaded`]; a panic or cancellation of the
    /// session task becomes [`Status::InternalError`].
    pub async fn dispatch(&self, request: CheckRequest) -> CheckResult {
        let permit = match self.admission.admit().await {
            Ok(permit) => permit,
            Err(reason) => {
                tracing::warn!(%reason, in_flight = self.admission.in_flight(), "Request not admitted");
                metrics::counter!("quizcheck_rejected_total", "reason" => reason.as_str())
                    .increment(1);
                return CheckResult::overloaded();
            }
        };
        metrics::gauge!("quizcheck_in_flight").set(self.admission.in_flight() as f64);

        let started = Instant::now();
        let grader = self.grader.clone();
        let session = tokio::spawn(
            async move {
                let _permit = permit;
                grader.grade(&request).await
            }
            .in_current_span(),
        );

        let result = match session.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Grading session failed");
                CheckResult::internal_error()
            }
        };

        metrics::histogram!("quizcheck_grade_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        metrics::gauge!("quizcheck_in_flight").set(self.admission.in_flight() as f64);
        result
    }
}

#[async_trait]
impl Checker for CheckerService {
    async fn run_tests(
        &self,
        request: Request<proto::CheckRequest>,
    ) -> Result<Response<proto::CheckResult>, tonic::Status> {
        let request_id = Uuid::new_v4();
        let proto::CheckRequest { id, source } = request.into_inner();
        let span = tracing::info_span!("run_tests", %request_id, check = %id);

        async move {
            let request = CheckRequest::new(id, source);
            if let Err(e) = self.limits.validate(&request) {
                tracing::info!(error = %e, "Rejected malformed request");
                metrics::counter!("quizcheck_requests_total", "status" => Status::InvalidRequest.as_str())
                    .increment(1);
                return Err(tonic::Status::invalid_argument(e.to_string()));
            }

            let result = self.dispatch(request).await;
            tracing::info!(status = %result.status, "Request complete");
            metrics::counter!("quizcheck_requests_total", "status" => result.status.as_str())
                .increment(1);
            Ok(Response::new(result.into()))
        }
        .instrument(span)
        .await
    }
}

/// Serve `service` on `listener` until `shutdown` is cancelled, then drain
/// in-flight requests.
///
/// # Errors
///
/// Returns an error if the transport fails.
pub async fn serve(
    listener: TcpListener,
    service: CheckerService,
    shutdown: CancellationToken,
) -> Result<(), tonic::transport::Error> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Checker service listening");
    }
    Server::builder()
        .add_service(service.into_server())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
        .await
}

impl From<CheckResult> for proto::CheckResult {
    fn from(result: CheckResult) -> Self {
        let Score { passed, total } = result.score.unwrap_or_default();
        Self {
            error: result.error_text().to_string(),
            status: result.status.code(),
            response: result.response,
            passed,
            total,
        }
    }
}

impl From<proto::CheckResult> for CheckResult {
    fn from(result: proto::CheckResult) -> Self {
        let status = Status::from_code(result.status).unwrap_or(Status::InternalError);
        Self {
            response: result.response,
            status,
            score: (result.total > 0).then_some(Score {
                passed: result.passed,
                total: result.total,
            }),
        }
    }
}
