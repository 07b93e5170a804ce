//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::state::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc, Weekday};
use class_scheduler_core::{
    classify, AttendanceRecord, AttendanceStatus, AttendanceSubmission, CreditAccount,
    Curriculum, GenerationError, GenerationOutcome, LedgerEntry, LedgerReceipt, Lesson, Module,
    PortError,
    ReconcileError, Reconciliation, Session, WeeklyPattern,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        generate_sessions_handler,
        activate_group_handler,
        list_group_sessions_handler,
        get_session_handler,
        submit_attendance_handler,
        get_credits_handler,
        list_ledger_handler,
    ),
    components(
        schemas(
            GenerateSessionsRequest,
            CurriculumPayload,
            ModulePayload,
            LessonPayload,
            WeeklyPatternPayload,
            GenerateSessionsResponse,
            SessionView,
            AttendanceView,
            SubmitAttendanceRequest,
            AttendanceLine,
            SubmitAttendanceResponse,
            AttendanceStatsView,
            LedgerResultView,
            StudentFailureView,
            ThresholdView,
            CreditAccountView,
            PackageView,
            LedgerEntryView,
            ReceiptView,
            UnsavedAttendanceView,
        )
    ),
    tags(
        (name = "Class Scheduler API", description = "Session generation, attendance and the credit ledger.")
    )
)]
pub struct ApiDoc;

type ApiResult<T> = Result<T, (StatusCode, String)>;

//=========================================================================================
// API Request Payloads
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct LessonPayload {
    pub title: String,
    /// Defaults to 2 when omitted.
    pub sessions_required: Option<u32>,
}

#[derive(Deserialize, ToSchema)]
pub struct ModulePayload {
    pub title: String,
    #[serde(default)]
    pub lessons: Vec<LessonPayload>,
}

#[derive(Deserialize, ToSchema)]
pub struct CurriculumPayload {
    pub course_id: Uuid,
    pub modules: Vec<ModulePayload>,
}

impl CurriculumPayload {
    fn into_domain(self) -> Curriculum {
        Curriculum {
            course_id: self.course_id,
            modules: self
                .modules
                .into_iter()
                .map(|m| Module {
                    title: m.title,
                    lessons: m
                        .lessons
                        .into_iter()
                        .map(|l| match l.sessions_required {
                            Some(n) => Lesson::with_sessions(l.title, n),
                            None => Lesson::new(l.title),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Weekdays are names such as `"Mon"` or `"monday"`; times are `HH:MM` or `HH:MM:SS`.
#[derive(Deserialize, ToSchema)]
pub struct WeeklyPatternPayload {
    pub start_date: NaiveDate,
    pub days_of_week: Vec<String>,
    pub time_from: String,
    pub time_to: String,
    pub timezone: Option<String>,
}

fn parse_time(field: &str, raw: &str) -> ApiResult<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|_| {
            (
                StatusCode::BAD_REQUEST,
                format!("{} must be HH:MM, got '{}'", field, raw),
            )
        })
}

impl WeeklyPatternPayload {
    fn into_domain(self) -> ApiResult<WeeklyPattern> {
        let days_of_week = self
            .days_of_week
            .iter()
            .map(|d| {
                d.parse::<Weekday>().map_err(|_| {
                    (
                        StatusCode::BAD_REQUEST,
                        format!("'{}' is not a weekday", d),
                    )
                })
            })
            .collect::<ApiResult<Vec<_>>>()?;
        Ok(WeeklyPattern {
            start_date: self.start_date,
            days_of_week,
            time_from: parse_time("time_from", &self.time_from)?,
            time_to: parse_time("time_to", &self.time_to)?,
            timezone: self.timezone.unwrap_or_else(|| "UTC".to_string()),
        })
    }
}

#[derive(Deserialize, ToSchema)]
pub struct GenerateSessionsRequest {
    pub curriculum: CurriculumPayload,
    pub pattern: WeeklyPatternPayload,
}

#[derive(Deserialize, ToSchema)]
pub struct AttendanceLine {
    pub student_id: Uuid,
    /// One of `present`, `absent`, `late`, `excused`.
    pub status: String,
    pub notes: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct SubmitAttendanceRequest {
    pub records: Vec<AttendanceLine>,
}

//=========================================================================================
// API Response Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
pub struct AttendanceView {
    pub student_id: Uuid,
    pub status: String,
    pub notes: Option<String>,
    pub marked_at: DateTime<Utc>,
    pub marked_by: Option<Uuid>,
}

impl From<&AttendanceRecord> for AttendanceView {
    fn from(r: &AttendanceRecord) -> Self {
        Self {
            student_id: r.student_id,
            status: r.status.as_str().to_string(),
            notes: r.notes.clone(),
            marked_at: r.marked_at,
            marked_by: r.marked_by,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct SessionView {
    pub id: Uuid,
    pub group_id: Uuid,
    pub course_id: Uuid,
    pub module_index: usize,
    pub lesson_index: usize,
    pub session_number: u32,
    pub scheduled_date: NaiveDate,
    pub start_time: String,
    pub end_time: String,
    pub status: String,
    pub attendance_taken: bool,
    pub attendance: Vec<AttendanceView>,
}

impl From<&Session> for SessionView {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id,
            group_id: s.group_id,
            course_id: s.course_id,
            module_index: s.module_index,
            lesson_index: s.lesson_index,
            session_number: s.session_number,
            scheduled_date: s.scheduled_date,
            start_time: s.start_time.format("%H:%M").to_string(),
            end_time: s.end_time.format("%H:%M").to_string(),
            status: s.status.as_str().to_string(),
            attendance_taken: s.attendance_taken,
            attendance: s.attendance.iter().map(AttendanceView::from).collect(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct GenerateSessionsResponse {
    pub total_sessions: usize,
    pub estimated_weeks: usize,
    pub created: usize,
    pub retired: usize,
    pub preserved: usize,
    pub sessions: Vec<SessionView>,
}

impl From<GenerationOutcome> for GenerateSessionsResponse {
    fn from(o: GenerationOutcome) -> Self {
        Self {
            total_sessions: o.total_sessions,
            estimated_weeks: o.estimated_weeks,
            created: o.created,
            retired: o.retired,
            preserved: o.preserved,
            sessions: o.sessions.iter().map(SessionView::from).collect(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct AttendanceStatsView {
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub excused: usize,
}

#[derive(Serialize, ToSchema)]
pub struct LedgerResultView {
    pub student_id: Uuid,
    pub outcome: String,
    pub new_balance: Option<u32>,
    pub threshold: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct StudentFailureView {
    pub student_id: Uuid,
    pub error: String,
}

#[derive(Serialize, ToSchema)]
pub struct ThresholdView {
    pub student_id: Uuid,
    pub bucket: String,
    pub remaining_hours: u32,
}

#[derive(Serialize, ToSchema)]
pub struct SubmitAttendanceResponse {
    pub session_id: Uuid,
    pub group_id: Uuid,
    pub stats: AttendanceStatsView,
    pub ledger_results: Vec<LedgerResultView>,
    pub partial_failures: Vec<StudentFailureView>,
    pub threshold_events: Vec<ThresholdView>,
}

impl From<Reconciliation> for SubmitAttendanceResponse {
    fn from(r: Reconciliation) -> Self {
        Self {
            session_id: r.session_id,
            group_id: r.group_id,
            stats: AttendanceStatsView {
                present: r.stats.present,
                absent: r.stats.absent,
                late: r.stats.late,
                excused: r.stats.excused,
            },
            ledger_results: r
                .ledger_results
                .iter()
                .map(|l| LedgerResultView {
                    student_id: l.student_id,
                    outcome: l.outcome.as_str().to_string(),
                    new_balance: l.new_balance,
                    threshold: l.threshold.map(|b| b.as_str().to_string()),
                })
                .collect(),
            partial_failures: r
                .partial_failures
                .iter()
                .map(|f| StudentFailureView {
                    student_id: f.student_id,
                    error: f.error.to_string(),
                })
                .collect(),
            threshold_events: r
                .threshold_events
                .iter()
                .map(|t| ThresholdView {
                    student_id: t.student_id,
                    bucket: t.bucket.as_str().to_string(),
                    remaining_hours: t.remaining_hours,
                })
                .collect(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct PackageView {
    pub id: Uuid,
    pub total_hours: u32,
    pub remaining_hours: u32,
    pub status: String,
}

#[derive(Serialize, ToSchema)]
pub struct CreditAccountView {
    pub student_id: Uuid,
    pub package: Option<PackageView>,
    pub total_hours_used: u32,
    pub total_hours_remaining: u32,
    pub total_sessions_attended: u32,
    /// `normal`, `low` or `zero` for the active package; absent without one.
    pub balance_bucket: Option<String>,
}

impl From<CreditAccount> for CreditAccountView {
    fn from(a: CreditAccount) -> Self {
        let balance_bucket = a
            .active_package()
            .map(|p| classify(p.remaining_hours).as_str().to_string());
        Self {
            student_id: a.student_id,
            package: a.package.map(|p| PackageView {
                id: p.id,
                total_hours: p.total_hours,
                remaining_hours: p.remaining_hours,
                status: p.status.as_str().to_string(),
            }),
            total_hours_used: a.stats.total_hours_used,
            total_hours_remaining: a.stats.total_hours_remaining,
            total_sessions_attended: a.stats.total_sessions_attended,
            balance_bucket,
        }
    }
}

/// A ledger mutation that went through even though the submission as a whole did not.
#[derive(Serialize, ToSchema)]
pub struct ReceiptView {
    pub student_id: Uuid,
    pub kind: String,
    pub hours: u32,
    pub remaining_hours: u32,
}

impl From<LedgerReceipt> for ReceiptView {
    fn from(r: LedgerReceipt) -> Self {
        Self {
            student_id: r.student_id,
            kind: r.kind.as_str().to_string(),
            hours: r.hours,
            remaining_hours: r.remaining_hours,
        }
    }
}

/// Body of a 503 from attendance submission. `applied` lists the confirmed
/// ledger mutations; students in `unconfirmed` may or may not have been charged.
#[derive(Serialize, ToSchema)]
pub struct UnsavedAttendanceView {
    pub error: String,
    pub applied: Vec<ReceiptView>,
    pub unconfirmed: Vec<Uuid>,
}

#[derive(Serialize, ToSchema)]
pub struct LedgerEntryView {
    pub id: Uuid,
    pub package_id: Uuid,
    pub session_id: Uuid,
    pub group_id: Uuid,
    pub kind: String,
    pub hours: u32,
    pub balance_after: u32,
    pub reason: String,
    pub actor: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<LedgerEntry> for LedgerEntryView {
    fn from(e: LedgerEntry) -> Self {
        Self {
            id: e.id,
            package_id: e.package_id,
            session_id: e.session_id,
            group_id: e.group_id,
            kind: e.kind.as_str().to_string(),
            hours: e.hours,
            balance_after: e.balance_after,
            reason: e.reason,
            actor: e.actor,
            created_at: e.created_at,
        }
    }
}

//=========================================================================================
// Error Mapping
//=========================================================================================

fn port_error_response(e: PortError) -> (StatusCode, String) {
    match e {
        PortError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        PortError::Unavailable(msg) => {
            warn!("Store unavailable: {}", msg);
            (StatusCode::SERVICE_UNAVAILABLE, "Store unavailable".to_string())
        }
        other => {
            error!("Store error: {:?}", other);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        }
    }
}

fn generation_error_response(e: GenerationError) -> (StatusCode, String) {
    match e {
        GenerationError::InvalidSchedule(_) | GenerationError::EmptyCurriculum => {
            (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
        GenerationError::GroupNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        GenerationError::Persistence(p) => port_error_response(p),
    }
}

fn reconcile_error_response(e: ReconcileError) -> Response {
    match e {
        ReconcileError::SessionNotFound(_) => {
            (StatusCode::NOT_FOUND, e.to_string()).into_response()
        }
        ReconcileError::SessionCancelled(_) => {
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        ReconcileError::DuplicateStudent(_) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        ReconcileError::Persistence {
            source,
            applied,
            unconfirmed,
        } => {
            error!(
                error = %source,
                applied = applied.len(),
                unconfirmed = unconfirmed.len(),
                "Attendance submission did not complete"
            );
            let body = UnsavedAttendanceView {
                error: "Attendance was not saved; the submission can be retried".to_string(),
                applied: applied.into_iter().map(ReceiptView::from).collect(),
                unconfirmed,
            };
            (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
        }
    }
}

fn marked_by(headers: &HeaderMap) -> ApiResult<Option<Uuid>> {
    match headers.get("x-user-id") {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(Some)
            .ok_or_else(|| {
                (
                    StatusCode::BAD_REQUEST,
                    "Invalid x-user-id format".to_string(),
                )
            }),
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Generate or regenerate a group's sessions from an explicit curriculum and pattern.
#[utoipa::path(
    post,
    path = "/groups/{group_id}/sessions",
    request_body = GenerateSessionsRequest,
    responses(
        (status = 201, description = "Sessions generated", body = GenerateSessionsResponse),
        (status = 400, description = "Malformed weekday or time"),
        (status = 422, description = "Invalid weekly pattern or empty curriculum"),
        (status = 503, description = "Store unavailable; nothing was written")
    ),
    params(("group_id" = Uuid, Path, description = "The group to schedule."))
)]
pub async fn generate_sessions_handler(
    State(app_state): State<Arc<AppState>>,
    Path(group_id): Path<Uuid>,
    Json(request): Json<GenerateSessionsRequest>,
) -> ApiResult<impl IntoResponse> {
    let pattern = request.pattern.into_domain()?;
    let curriculum = request.curriculum.into_domain();

    let outcome = app_state
        .scheduler
        .generate_sessions(group_id, &curriculum, &pattern, today())
        .await
        .map_err(generation_error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(GenerateSessionsResponse::from(outcome)),
    ))
}

/// Generate sessions from the group's stored course and weekly pattern.
#[utoipa::path(
    post,
    path = "/groups/{group_id}/activate",
    responses(
        (status = 201, description = "Sessions generated", body = GenerateSessionsResponse),
        (status = 404, description = "Group or course not found"),
        (status = 422, description = "Stored pattern is invalid or the curriculum is empty")
    ),
    params(("group_id" = Uuid, Path, description = "The group to activate."))
)]
pub async fn activate_group_handler(
    State(app_state): State<Arc<AppState>>,
    Path(group_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let outcome = app_state
        .scheduler
        .activate_group(group_id, today())
        .await
        .map_err(generation_error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(GenerateSessionsResponse::from(outcome)),
    ))
}

#[utoipa::path(
    get,
    path = "/groups/{group_id}/sessions",
    responses((status = 200, description = "The group's sessions ordered by date", body = [SessionView])),
    params(("group_id" = Uuid, Path, description = "The group."))
)]
pub async fn list_group_sessions_handler(
    State(app_state): State<Arc<AppState>>,
    Path(group_id): Path<Uuid>,
) -> ApiResult<Json<Vec<SessionView>>> {
    let sessions = app_state
        .scheduler
        .group_sessions(group_id)
        .await
        .map_err(port_error_response)?;
    Ok(Json(sessions.iter().map(SessionView::from).collect()))
}

#[utoipa::path(
    get,
    path = "/sessions/{session_id}",
    responses(
        (status = 200, description = "The session with its attendance", body = SessionView),
        (status = 404, description = "Session not found")
    ),
    params(("session_id" = Uuid, Path, description = "The session."))
)]
pub async fn get_session_handler(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> ApiResult<Json<SessionView>> {
    let session = app_state
        .scheduler
        .session(session_id)
        .await
        .map_err(port_error_response)?;
    Ok(Json(SessionView::from(&session)))
}

/// Record attendance for a session and apply the resulting credit changes.
///
/// Students whose credit could not be charged are listed in `partial_failures`;
/// their attendance is still recorded.
#[utoipa::path(
    post,
    path = "/sessions/{session_id}/attendance",
    request_body = SubmitAttendanceRequest,
    responses(
        (status = 200, description = "Attendance recorded", body = SubmitAttendanceResponse),
        (status = 400, description = "Unknown status or a student listed twice"),
        (status = 404, description = "Session not found"),
        (status = 409, description = "Session is cancelled"),
        (status = 503, description = "Attendance not saved; safe to retry", body = UnsavedAttendanceView)
    ),
    params(
        ("session_id" = Uuid, Path, description = "The session."),
        ("x-user-id" = Option<Uuid>, Header, description = "The operator marking attendance.")
    )
)]
pub async fn submit_attendance_handler(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<SubmitAttendanceRequest>,
) -> Result<Json<SubmitAttendanceResponse>, Response> {
    let marked_by = marked_by(&headers).map_err(IntoResponse::into_response)?;
    let submissions = request
        .records
        .into_iter()
        .map(|line| {
            let status = line
                .status
                .parse::<AttendanceStatus>()
                .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
            Ok(AttendanceSubmission {
                student_id: line.student_id,
                status,
                notes: line.notes,
            })
        })
        .collect::<ApiResult<Vec<_>>>()
        .map_err(IntoResponse::into_response)?;

    let reconciliation = app_state
        .scheduler
        .submit_attendance(session_id, submissions, marked_by)
        .await
        .map_err(reconcile_error_response)?;

    Ok(Json(SubmitAttendanceResponse::from(reconciliation)))
}

#[utoipa::path(
    get,
    path = "/students/{student_id}/credits",
    responses((status = 200, description = "Credit package and running totals", body = CreditAccountView)),
    params(("student_id" = Uuid, Path, description = "The student."))
)]
pub async fn get_credits_handler(
    State(app_state): State<Arc<AppState>>,
    Path(student_id): Path<Uuid>,
) -> ApiResult<Json<CreditAccountView>> {
    let account = app_state
        .scheduler
        .credit_account(student_id)
        .await
        .map_err(port_error_response)?;
    Ok(Json(CreditAccountView::from(account)))
}

#[utoipa::path(
    get,
    path = "/students/{student_id}/ledger",
    responses((status = 200, description = "Ledger entries, newest first", body = [LedgerEntryView])),
    params(("student_id" = Uuid, Path, description = "The student."))
)]
pub async fn list_ledger_handler(
    State(app_state): State<Arc<AppState>>,
    Path(student_id): Path<Uuid>,
) -> ApiResult<Json<Vec<LedgerEntryView>>> {
    let entries = app_state
        .scheduler
        .ledger_entries(student_id)
        .await
        .map_err(port_error_response)?;
    Ok(Json(entries.into_iter().map(LedgerEntryView::from).collect()))
}
