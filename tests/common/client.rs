//! HTTP client for end-to-end tests
//!
//! Wraps reqwest with one method per admin endpoint. When routes or request
//! formats change, update only this file.

use super::constants::*;
use reqwest::Response;
use serde_json::json;
use std::time::Duration;

pub struct TestClient {
    /// The underlying reqwest client (public for custom requests in tests)
    pub client: reqwest::Client,
    pub base_url: String,
}

impl TestClient {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("Failed to build reqwest client");

        Self { client, base_url }
    }

    pub async fn home(&self) -> Response {
        self.client
            .get(format!("{}/", self.base_url))
            .send()
            .await
            .expect("Home request failed")
    }

    pub async fn metrics(&self) -> Response {
        self.client
            .get(format!("{}/metrics", self.base_url))
            .send()
            .await
            .expect("Metrics request failed")
    }

    pub async fn list_tasks(&self) -> Response {
        self.client
            .get(format!("{}/v1/admin/tasks", self.base_url))
            .send()
            .await
            .expect("List tasks request failed")
    }

    pub async fn run_task(&self, name: &str) -> Response {
        self.client
            .post(format!("{}/v1/admin/tasks/{}/run", self.base_url, name))
            .send()
            .await
            .expect("Run task request failed")
    }

    pub async fn set_task_enabled(&self, name: &str, enabled: bool) -> Response {
        self.client
            .put(format!("{}/v1/admin/tasks/{}/enabled", self.base_url, name))
            .json(&json!({ "enabled": enabled }))
            .send()
            .await
            .expect("Set enabled request failed")
    }

    pub async fn list_circuits(&self) -> Response {
        self.client
            .get(format!("{}/v1/admin/circuits", self.base_url))
            .send()
            .await
            .expect("List circuits request failed")
    }

    pub async fn list_duplicates(&self) -> Response {
        self.client
            .get(format!("{}/v1/admin/duplicates", self.base_url))
            .send()
            .await
            .expect("List duplicates request failed")
    }

    /// Runs a task and returns the JSON outcome, asserting a 200.
    pub async fn run_task_json(&self, name: &str) -> serde_json::Value {
        let response = self.run_task(name).await;
        assert_eq!(
            response.status(),
            reqwest::StatusCode::OK,
            "Running {} failed",
            name
        );
        response.json().await.expect("Invalid run task response")
    }
}
