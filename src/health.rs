use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let providers = state.providers().summary();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "providers": providers,
        "connections": {
            "active": metrics.active_connections,
            "max_sessions_per_connection": config.session.max_concurrent_sessions
        },
        "sessions": session_summary(&metrics),
        "memory": get_memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "http": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            },
            "endpoints": endpoint_stats
        },
        "websocket": {
            "active_connections": metrics.active_connections,
            "sessions": session_summary(&metrics),
            "outcomes": {
                "audio_stored": metrics.audio_stored,
                "storage_errors": metrics.storage_errors,
                "recognitions_completed": metrics.recognitions_completed,
                "recognition_errors": metrics.recognition_errors,
                "recognition_success_rate": metrics.recognition_success_rate(),
                "session_errors": metrics.session_errors,
                "text_replies": metrics.text_replies
            }
        },
        "memory": get_memory_info()
    }))
}

fn session_summary(metrics: &AppMetrics) -> serde_json::Value {
    json!({
        "started": metrics.sessions_started,
        "finalized": metrics.sessions_finalized,
        "audio_bytes_received": metrics.audio_bytes_received
    })
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", process::id())) {
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for pid {}", process::id())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_providers() {
        let state = AppState::new(AppConfig::default()).unwrap();
        state.connection_opened();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["providers"]["recognition"], "volcengine");
        assert_eq!(body["connections"]["active"], 1);
    }

    #[actix_web::test]
    async fn test_metrics_lists_outcomes() {
        let state = AppState::new(AppConfig::default()).unwrap();
        state.record_session_started();
        state.record_endpoint_request("GET /health", 4, false);

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/api/v1/metrics").to_request()).await;
        assert_eq!(body["websocket"]["sessions"]["started"], 1);
        assert_eq!(body["http"]["endpoints"][0]["endpoint"], "GET /health");
    }
}
