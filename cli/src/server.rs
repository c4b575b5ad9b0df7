use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;

use larder_core::error::LarderError;
use larder_core::models::{
    ConfirmedMatch, MatchCandidate, NutritionSummary, Rejection, ReviewStats,
};
use larder_core::review::{BulkItemResult, ConfirmRequest, PendingFilter, PendingItem};
use larder_core::service::LarderService;

const BODY_LIMIT: usize = 2 * 1024 * 1024; // 2 MB

#[derive(Clone)]
struct AppState {
    svc: Arc<Mutex<LarderService>>,
}

impl AppState {
    fn service(&self) -> MutexGuard<'_, LarderService> {
        self.svc.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct MatchQuery {
    q: String,
}

#[derive(Deserialize)]
struct RejectRequest {
    recipe_ingredient_id: String,
}

#[derive(Deserialize)]
struct OverrideRequest {
    recipe_ingredient_id: String,
    canonical_id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::Internal(err) => {
                tracing::error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<LarderError>() {
            Some(e @ LarderError::NotFound(_)) => Self::NotFound(e.to_string()),
            Some(e @ LarderError::InvalidInput(_)) => Self::BadRequest(e.to_string()),
            Some(e @ LarderError::StoreUnavailable(_)) => Self::Unavailable(e.to_string()),
            _ => Self::Internal(err),
        }
    }
}

// --- Middleware ---

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn find_match(
    State(state): State<AppState>,
    Query(query): Query<MatchQuery>,
) -> Result<Json<Vec<MatchCandidate>>, ApiError> {
    if query.q.trim().is_empty() {
        return Err(ApiError::BadRequest("query 'q' must not be empty".to_string()));
    }
    let candidates = state.service().find_match(&query.q)?;
    Ok(Json(candidates))
}

async fn list_pending(
    State(state): State<AppState>,
    Query(filter): Query<PendingFilter>,
) -> Result<Json<Vec<PendingItem>>, ApiError> {
    let items = state.service().list_pending(&filter)?;
    Ok(Json(items))
}

async fn confirm(
    State(state): State<AppState>,
    Json(req): Json<ConfirmRequest>,
) -> Result<Json<ConfirmedMatch>, ApiError> {
    let confirmed = state.service().confirm(&req)?;
    Ok(Json(confirmed))
}

async fn reject(
    State(state): State<AppState>,
    Json(req): Json<RejectRequest>,
) -> Result<Json<Rejection>, ApiError> {
    let rejection = state.service().reject(&req.recipe_ingredient_id)?;
    Ok(Json(rejection))
}

async fn manual_override(
    State(state): State<AppState>,
    Json(req): Json<OverrideRequest>,
) -> Result<Json<ConfirmedMatch>, ApiError> {
    let confirmed = state
        .service()
        .manual_override(&req.recipe_ingredient_id, &req.canonical_id)?;
    Ok(Json(confirmed))
}

async fn bulk_confirm(
    State(state): State<AppState>,
    Json(items): Json<Vec<ConfirmRequest>>,
) -> Json<Vec<BulkItemResult>> {
    Json(state.service().bulk_confirm(&items))
}

async fn recipe_nutrition(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NutritionSummary>, ApiError> {
    let summary = state.service().aggregate(&id)?;
    Ok(Json(summary))
}

async fn review_stats(State(state): State<AppState>) -> Result<Json<ReviewStats>, ApiError> {
    let stats = state.service().review_stats()?;
    Ok(Json(stats))
}

// --- Router ---

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/match", get(find_match))
        .route("/api/pending", get(list_pending))
        .route("/api/confirm", post(confirm))
        .route("/api/reject", post(reject))
        .route("/api/override", post(manual_override))
        .route("/api/bulk-confirm", post(bulk_confirm))
        .route("/api/recipes/{id}/nutrition", get(recipe_nutrition))
        .route("/api/review/stats", get(review_stats))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(svc: LarderService, port: u16, bind: &str) -> anyhow::Result<()> {
    let state = AppState {
        svc: Arc::new(Mutex::new(svc)),
    };
    let app = build_router(state);

    if bind != "127.0.0.1" && bind != "localhost" {
        eprintln!(
            "Warning: Listening on {bind} with no authentication. Any device on your network can access this API."
        );
    }

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    eprintln!("Listening on http://{bind}:{port}");
    tracing::info!(%bind, port, "review API started");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use larder_core::service::ImportOptions;
    use tower::ServiceExt;

    const DATASET: &str = "FoodID,FødevareNavn,FødevareGruppe,Energy_kcal,Protein,VitaminC\n\
        1,\"Kyllingebryst, rå\",Meat,165,31,\n\
        2,\"Tomat, rå\",Vegetables,18,\"0,9\",14\n\
        3,\"Olie, oliven\",Oils,884,0,\n";

    struct Fixture {
        state: AppState,
        recipe_id: String,
        chicken_ing: String,
        tomato_ing: String,
    }

    fn fixture() -> Fixture {
        let svc = LarderService::new_in_memory().unwrap();
        svc.import_dataset(DATASET.as_bytes(), ImportOptions::default())
            .unwrap();
        let recipe = svc.create_recipe("Kylling med tomat", 2.0).unwrap();
        let chicken = svc
            .add_ingredient(&recipe.id, "kyllingebryst", 200.0, "g")
            .unwrap();
        let tomato = svc.add_ingredient(&recipe.id, "tomater", 200.0, "g").unwrap();
        Fixture {
            state: AppState {
                svc: Arc::new(Mutex::new(svc)),
            },
            recipe_id: recipe.id,
            chicken_ing: chicken.id,
            tomato_ing: tomato.id,
        }
    }

    fn canonical_id(f: &Fixture, text: &str) -> String {
        f.state.service().find_match(text).unwrap()[0]
            .canonical_id
            .clone()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, value: &serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn security_headers_present() {
        let app = build_router(fixture().state);

        let response = app
            .oneshot(
                axum::http::Request::get("/api/review/stats")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
        assert_eq!(
            response.headers().get("content-security-policy").unwrap(),
            "default-src 'none'"
        );
    }

    #[tokio::test]
    async fn match_returns_candidates() {
        let app = build_router(fixture().state);

        let response = app
            .oneshot(
                axum::http::Request::get("/api/match?q=olivenolie")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json[0]["canonical_name"], "Olie, oliven");
        assert_eq!(json[0]["match_type"], "synonym");
    }

    #[tokio::test]
    async fn match_empty_query_is_bad_request() {
        let app = build_router(fixture().state);

        let response = app
            .oneshot(
                axum::http::Request::get("/api/match?q=%20")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pending_lists_suggestions() {
        let f = fixture();
        let app = build_router(f.state.clone());

        let uri = format!("/api/pending?recipe_id={}&limit=10", f.recipe_id);
        let response = app
            .oneshot(axum::http::Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let items = json.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["ingredient"]["id"], f.chicken_ing.as_str());
        assert_eq!(items[0]["outcome"]["status"], "suggested");
    }

    #[tokio::test]
    async fn confirm_then_nutrition() {
        let f = fixture();
        let chicken = canonical_id(&f, "kyllingebryst");

        let response = build_router(f.state.clone())
            .oneshot(post_json(
                "/api/confirm",
                &serde_json::json!({
                    "recipe_ingredient_id": f.chicken_ing,
                    "canonical_id": chicken,
                    "confidence": 95,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["match_type"], "exact");

        let response = build_router(f.state.clone())
            .oneshot(
                axum::http::Request::get(format!("/api/recipes/{}/nutrition", f.recipe_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["per_serving"]["calories"], 165.0);
        assert_eq!(json["per_serving"]["protein"], 31.0);
        assert_eq!(json["ingredients_with_nutrition"], 1);
    }

    #[tokio::test]
    async fn confirm_unknown_ingredient_is_not_found() {
        let f = fixture();
        let chicken = canonical_id(&f, "kyllingebryst");

        let response = build_router(f.state)
            .oneshot(post_json(
                "/api/confirm",
                &serde_json::json!({
                    "recipe_ingredient_id": "missing",
                    "canonical_id": chicken,
                    "confidence": 95,
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn confirm_out_of_range_confidence_is_bad_request() {
        let f = fixture();
        let chicken = canonical_id(&f, "kyllingebryst");

        let response = build_router(f.state)
            .oneshot(post_json(
                "/api/confirm",
                &serde_json::json!({
                    "recipe_ingredient_id": f.chicken_ing,
                    "canonical_id": chicken,
                    "confidence": 150,
                }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn reject_and_override() {
        let f = fixture();
        let tomato = canonical_id(&f, "tomat");

        let response = build_router(f.state.clone())
            .oneshot(post_json(
                "/api/reject",
                &serde_json::json!({ "recipe_ingredient_id": f.tomato_ing }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = build_router(f.state.clone())
            .oneshot(post_json(
                "/api/override",
                &serde_json::json!({
                    "recipe_ingredient_id": f.tomato_ing,
                    "canonical_id": tomato,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["match_type"], "manual");
        assert_eq!(json["confidence"], 100);

        let stats = f.state.service().review_stats().unwrap();
        assert_eq!((stats.confirmed, stats.rejected), (1, 0));
    }

    #[tokio::test]
    async fn bulk_confirm_reports_each_item() {
        let f = fixture();
        let chicken = canonical_id(&f, "kyllingebryst");
        let tomato = canonical_id(&f, "tomat");

        let response = build_router(f.state.clone())
            .oneshot(post_json(
                "/api/bulk-confirm",
                &serde_json::json!([
                    { "recipe_ingredient_id": f.chicken_ing, "canonical_id": chicken, "confidence": 95 },
                    { "recipe_ingredient_id": f.tomato_ing, "canonical_id": "nope", "confidence": 88 },
                    { "recipe_ingredient_id": f.tomato_ing, "canonical_id": tomato, "confidence": 88 },
                ]),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        let items = json.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert!(items[0]["error"].is_null());
        assert!(items[1]["error"].is_string());
        assert_eq!(items[2]["confirmed"]["match_type"], "synonym");

        let stats = f.state.service().review_stats().unwrap();
        assert_eq!((stats.confirmed, stats.pending), (2, 0));
    }

    #[tokio::test]
    async fn nutrition_unknown_recipe_is_not_found() {
        let app = build_router(fixture().state);

        let response = app
            .oneshot(
                axum::http::Request::get("/api/recipes/missing/nutrition")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("missing"));
    }

    #[tokio::test]
    async fn body_size_limit_rejects_oversized() {
        let app = build_router(fixture().state);

        let big_body = vec![0u8; BODY_LIMIT + 1];
        let response = app
            .oneshot(
                axum::http::Request::post("/api/bulk-confirm")
                    .header("content-type", "application/json")
                    .body(Body::from(big_body))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn internal_error_does_not_leak_details() {
        let error = ApiError::Internal(anyhow::anyhow!("secret database path /home/user/.larder/db"));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert_eq!(json["error"], "Internal server error");
        assert!(!json["error"].as_str().unwrap().contains("secret"));
    }

    #[test]
    fn store_busy_maps_to_unavailable() {
        let err: anyhow::Error = LarderError::StoreUnavailable("database is locked".to_string()).into();
        let response = ApiError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
