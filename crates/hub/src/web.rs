//! HTTP/JSON surface over the api layer. Routes do no logic of their own:
//! parse, delegate, serialize.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

use crate::api;
use crate::error::Error;
use crate::scheduler::Runtime;

type AppState = Arc<Runtime>;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Config { .. } => StatusCode::BAD_REQUEST,
            Error::Safety(_) => StatusCode::CONFLICT,
            Error::Transient(_) | Error::Persistent(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn not_found() -> ApiError {
    ApiError(Error::config("id", "not found"))
}

impl ApiError {
    fn status_404(self) -> Response {
        (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "not found" })),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/drivers", get(drivers))
        .route("/api/controller-types", get(controller_types))
        .route("/api/sensors", get(sensors_list).post(sensors_create))
        .route(
            "/api/sensors/:id",
            get(sensors_get).put(sensors_update).delete(sensors_delete),
        )
        .route("/api/sensors/:id/measurements", get(sensors_measurements))
        .route(
            "/api/sensors/:id/calibration",
            get(calibration_get)
                .post(calibration_add)
                .delete(calibration_clear),
        )
        .route("/api/sensors/:id/sample", get(calibration_sample))
        .route(
            "/api/controllers",
            get(controllers_list).post(controllers_create),
        )
        .route(
            "/api/controllers/:id",
            get(controllers_get)
                .put(controllers_update)
                .delete(controllers_delete),
        )
        .route("/api/controllers/:id/sensors", get(bound_sensors))
        .route(
            "/api/controllers/:id/sensors/:sensor_id",
            post(bind).delete(unbind),
        )
        .route("/api/controllers/:id/run", post(controllers_run_now))
        .route("/api/controllers/:id/actions", get(controller_actions))
        .route("/api/outputs", get(outputs_list))
        .route("/api/outputs/panic-off", post(outputs_panic_off))
        .route("/api/outputs/clear-panic", post(outputs_clear_panic))
        .route("/api/outputs/:pin/set", post(outputs_set))
        .route("/api/outputs/:pin/pulse", post(outputs_pulse))
        .route("/api/system/status", get(system_status))
        .route("/api/system/start", post(system_start))
        .route("/api/system/stop", post(system_stop))
        .route("/api/system/measurements", get(system_measurements))
        .with_state(state)
}

async fn drivers() -> impl IntoResponse {
    Json(api::available_drivers())
}

async fn controller_types() -> impl IntoResponse {
    Json(api::available_controllers())
}

// -- Sensors ----------------------------------------------------------------

async fn sensors_list(State(rt): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(api::list_sensors(&rt).await?))
}

async fn sensors_create(
    State(rt): State<AppState>,
    Json(input): Json<api::SensorInput>,
) -> ApiResult<impl IntoResponse> {
    let view = api::create_sensor(&rt, &input).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn sensors_get(State(rt): State<AppState>, Path(id): Path<i64>) -> Response {
    match api::get_sensor(&rt, id).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => not_found().status_404(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn sensors_update(
    State(rt): State<AppState>,
    Path(id): Path<i64>,
    Json(input): Json<api::SensorInput>,
) -> Response {
    match api::update_sensor(&rt, id, &input).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => not_found().status_404(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn sensors_delete(State(rt): State<AppState>, Path(id): Path<i64>) -> Response {
    match api::delete_sensor(&rt, id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found().status_404(),
        Err(e) => ApiError(e).into_response(),
    }
}

#[derive(Deserialize)]
struct RangeQuery {
    start: Option<i64>,
    end: Option<i64>,
    limit: Option<usize>,
}

async fn sensors_measurements(
    State(rt): State<AppState>,
    Path(id): Path<i64>,
    Query(range): Query<RangeQuery>,
) -> ApiResult<impl IntoResponse> {
    let measurements = api::sensor_measurements(
        &rt,
        id,
        range.start.unwrap_or(0),
        range.end.unwrap_or(i64::MAX),
        range.limit,
    )
    .await?;
    Ok(Json(measurements))
}

// -- Calibration ------------------------------------------------------------

async fn calibration_get(
    State(rt): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(api::calibration_points(&rt, id).await?))
}

#[derive(Deserialize)]
struct CalPointBody {
    raw: f64,
    real: f64,
}

async fn calibration_add(
    State(rt): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<CalPointBody>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        api::add_calibration_point(&rt, id, body.raw, body.real).await?,
    ))
}

async fn calibration_clear(
    State(rt): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    api::clear_calibration(&rt, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn calibration_sample(
    State(rt): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(api::sample_raw(&rt, id).await?))
}

// -- Controllers ------------------------------------------------------------

async fn controllers_list(State(rt): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(api::list_controllers(&rt).await?))
}

async fn controllers_create(
    State(rt): State<AppState>,
    Json(input): Json<api::ControllerInput>,
) -> ApiResult<impl IntoResponse> {
    let view = api::create_controller(&rt, &input).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn controllers_get(State(rt): State<AppState>, Path(id): Path<i64>) -> Response {
    match api::get_controller(&rt, id).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => not_found().status_404(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn controllers_update(
    State(rt): State<AppState>,
    Path(id): Path<i64>,
    Json(input): Json<api::ControllerInput>,
) -> Response {
    match api::update_controller(&rt, id, &input).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => not_found().status_404(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn controllers_delete(State(rt): State<AppState>, Path(id): Path<i64>) -> Response {
    match api::delete_controller(&rt, id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => not_found().status_404(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn bound_sensors(
    State(rt): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(api::list_bound_sensors(&rt, id).await?))
}

async fn bind(
    State(rt): State<AppState>,
    Path((id, sensor_id)): Path<(i64, i64)>,
) -> ApiResult<impl IntoResponse> {
    api::bind_sensor(&rt, id, sensor_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unbind(
    State(rt): State<AppState>,
    Path((id, sensor_id)): Path<(i64, i64)>,
) -> ApiResult<impl IntoResponse> {
    match api::unbind_sensor(&rt, id, sensor_id).await? {
        true => Ok(StatusCode::NO_CONTENT.into_response()),
        false => Ok(not_found().status_404()),
    }
}

async fn controllers_run_now(
    State(rt): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    api::run_now(&rt, id).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn controller_actions(
    State(rt): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        api::recent_actions(&rt, id, q.limit.unwrap_or(50)).await?,
    ))
}

// -- Outputs ----------------------------------------------------------------

async fn outputs_list(State(rt): State<AppState>) -> impl IntoResponse {
    Json(api::list_outputs(&rt))
}

#[derive(Deserialize)]
struct SetBody {
    on: bool,
}

async fn outputs_set(
    State(rt): State<AppState>,
    Path(pin): Path<u8>,
    Json(body): Json<SetBody>,
) -> ApiResult<impl IntoResponse> {
    let previous = api::set_output(&rt, pin, body.on)?;
    Ok(Json(serde_json::json!({ "previous": previous })))
}

#[derive(Deserialize)]
struct PulseBody {
    seconds: f64,
}

async fn outputs_pulse(
    State(rt): State<AppState>,
    Path(pin): Path<u8>,
    Json(body): Json<PulseBody>,
) -> ApiResult<impl IntoResponse> {
    api::pulse_output(&rt, pin, body.seconds)?;
    Ok(StatusCode::ACCEPTED)
}

async fn outputs_panic_off(State(rt): State<AppState>) -> ApiResult<impl IntoResponse> {
    api::panic_off(&rt)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn outputs_clear_panic(State(rt): State<AppState>) -> impl IntoResponse {
    api::clear_panic(&rt);
    StatusCode::NO_CONTENT
}

// -- System -----------------------------------------------------------------

async fn system_status(State(rt): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(api::system_status(&rt).await?))
}

async fn system_start(State(rt): State<AppState>) -> impl IntoResponse {
    api::start_scheduler(&rt);
    StatusCode::NO_CONTENT
}

async fn system_stop(State(rt): State<AppState>) -> impl IntoResponse {
    api::stop_scheduler(&rt);
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct HoursQuery {
    hours: Option<f64>,
}

async fn system_measurements(
    State(rt): State<AppState>,
    Query(q): Query<HoursQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(
        api::recent_measurements(&rt, q.hours.unwrap_or(1.0)).await?,
    ))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(runtime: AppState, bind: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %bind, "http api listening");
    axum::serve(listener, router(runtime)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
