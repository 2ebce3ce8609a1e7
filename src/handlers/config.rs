use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "providers": state.providers().summary(),
        "config": config.redacted()
    })))
}

/// Partial update, e.g. `{"recognition": {"provider": "assemblyai"}}`.
///
/// Accepted keys are listed on `AppConfig::update_from_json`; the switch applies
/// to sessions finalized after the response.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;
    let updated = state.update_config(&json_str)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "providers": state.providers().summary(),
        "updated_config": updated.redacted()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{http::StatusCode, test, App};

    fn app(state: AppState) -> App<impl actix_web::dev::ServiceFactory<
        actix_web::dev::ServiceRequest,
        Config = (),
        Response = actix_web::dev::ServiceResponse,
        Error = actix_web::Error,
        InitError = (),
    >> {
        App::new()
            .app_data(web::Data::new(state))
            .route("/api/v1/config", web::get().to(get_config))
            .route("/api/v1/config", web::put().to(update_config))
    }

    #[actix_web::test]
    async fn test_get_masks_credentials() {
        let mut config = AppConfig::default();
        config.recognition.polling.api_key = "secret-key".into();
        let app = test::init_service(app(AppState::new(config).unwrap())).await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/api/v1/config").to_request()).await;
        assert_eq!(body["config"]["recognition"]["polling"]["api_key"], "********");
        assert!(!body.to_string().contains("secret-key"));
    }

    #[actix_web::test]
    async fn test_put_switches_recognizer() {
        let state = AppState::new(AppConfig::default()).unwrap();
        let app = test::init_service(app(state.clone())).await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"recognition": {"provider": "mock"}}))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["providers"]["recognition"], "mock");
        assert_eq!(state.providers().recognizer.name(), "mock");
    }

    #[actix_web::test]
    async fn test_put_rejects_unknown_provider() {
        let app = test::init_service(app(AppState::new(AppConfig::default()).unwrap())).await;

        let req = test::TestRequest::put()
            .uri("/api/v1/config")
            .set_json(json!({"synthesis": {"provider": "nope"}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
