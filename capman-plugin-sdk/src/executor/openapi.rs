//! # OpenAPI Remote Strategy
//!
//! Executes a verb against a remote HTTP API described by the manifest's
//! `api` section: the operation is resolved by verb or operation id, its
//! parameters are mapped from inputs into path, query, header, and body
//! positions, the configured authentication scheme is applied, and the
//! response comes back as one primary `PluginOutput` plus `statusCode` and
//! `responseTime` companions.

use super::resolve_credential;
use crate::error::{EngineResult, ErrorCode, StructuredError};
use crate::manifest::{ApiAuth, ApiConfig, ApiOperation, ApiParameterLocation, PluginManifest};
use crate::models::{InputValue, PluginOutput, ValueType};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

const COMPONENT: &str = "executor.openapi";

pub async fn execute(
    http: &reqwest::Client,
    manifest: &PluginManifest,
    api: &ApiConfig,
    inputs: &HashMap<String, InputValue>,
    default_timeout: Duration,
    trace_id: &str,
) -> EngineResult<Vec<PluginOutput>> {
    let operation = resolve_operation(api, &manifest.verb).ok_or_else(|| {
        StructuredError::report(
            ErrorCode::ApiOperationNotFound,
            COMPONENT,
            format!(
                "no operation for verb {} in plugin {}",
                manifest.verb, manifest.id
            ),
        )
        .trace(trace_id)
        .build()
    })?;

    let method = reqwest::Method::from_bytes(operation.method.to_ascii_uppercase().as_bytes())
        .map_err(|_| {
            StructuredError::report(
                ErrorCode::PluginManifestInvalid,
                COMPONENT,
                format!("operation {} has method {}", operation.operation_id, operation.method),
            )
            .trace(trace_id)
            .build()
        })?;

    let mut consumed: HashSet<&str> = HashSet::new();
    let path = fill_path(operation, inputs, &mut consumed, trace_id)?;
    let url = format!("{}{}", api.base_url.trim_end_matches('/'), path);

    let timeout = if api.timeout_secs > 0 {
        Duration::from_secs(api.timeout_secs)
    } else {
        default_timeout
    };
    let mut request = http.request(method.clone(), &url).timeout(timeout);

    let mut body = serde_json::Map::new();
    let mut has_body_params = false;
    for parameter in &operation.parameters {
        let input_name = parameter.input.as_deref().unwrap_or(&parameter.name);
        let Some(input) = inputs.get(input_name) else {
            continue;
        };
        consumed.insert(input_name);
        match parameter.location {
            ApiParameterLocation::Path => {} // already substituted
            ApiParameterLocation::Query => {
                request = request.query(&[(parameter.name.as_str(), query_text(&input.value))]);
            }
            ApiParameterLocation::Header => {
                request = request.header(parameter.name.as_str(), query_text(&input.value));
            }
            ApiParameterLocation::Body => {
                has_body_params = true;
                body.insert(parameter.name.clone(), input.value.clone());
            }
        }
    }

    // Without explicit body parameters, mutating methods carry the
    // remaining unmapped inputs as the JSON body.
    if !has_body_params && method != reqwest::Method::GET {
        for (name, input) in inputs {
            if !consumed.contains(name.as_str()) && !name.starts_with("__") {
                body.insert(name.clone(), input.value.clone());
            }
        }
    }
    if !body.is_empty() {
        request = request.json(&serde_json::Value::Object(body));
    }

    request = apply_auth(request, &api.auth, trace_id)?;

    let started = std::time::Instant::now();
    let response = request.send().await.map_err(|e| {
        StructuredError::report(
            ErrorCode::PluginExecutionFailed,
            COMPONENT,
            format!("request to {url} failed"),
        )
        .trace(trace_id)
        .cause(e)
        .build()
    })?;
    let elapsed = started.elapsed();

    let status = response.status();
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let (result, result_type, mime_type) = if content_type.contains("json") {
        let value: serde_json::Value = response.json().await.map_err(|e| {
            StructuredError::report(
                ErrorCode::PluginOutputMalformed,
                COMPONENT,
                format!("{url} returned unparseable JSON"),
            )
            .trace(trace_id)
            .cause(e)
            .build()
        })?;
        let result_type = ValueType::of(&value);
        (value, result_type, "application/json".to_string())
    } else {
        let text = response.text().await.unwrap_or_default();
        let mime = if content_type.is_empty() {
            "text/plain".to_string()
        } else {
            content_type.clone()
        };
        (serde_json::Value::String(text), ValueType::String, mime)
    };

    let mut primary = PluginOutput {
        success: status.is_success(),
        name: operation.operation_id.clone(),
        result_type,
        result,
        result_description: format!("{} {}", operation.method.to_ascii_uppercase(), path),
        error: (!status.is_success()).then(|| format!("remote answered {status}")),
        mime_type: Some(mime_type),
        file_name: None,
    };
    if !status.is_success() {
        primary.result_type = ValueType::Error;
    }

    Ok(vec![
        primary,
        PluginOutput::ok(
            "statusCode",
            serde_json::json!(status.as_u16()),
            "HTTP status of the remote call",
        )
        .with_type(ValueType::Number),
        PluginOutput::ok(
            "responseTime",
            serde_json::json!(elapsed.as_millis() as u64),
            "remote call duration in milliseconds",
        )
        .with_type(ValueType::Number),
    ])
}

/// By explicit verb binding first, operation id second; a single-operation
/// manifest answers every verb it is registered under.
fn resolve_operation<'a>(api: &'a ApiConfig, verb: &str) -> Option<&'a ApiOperation> {
    api.operations
        .iter()
        .find(|op| op.action_verb.as_deref() == Some(verb))
        .or_else(|| api.operations.iter().find(|op| op.operation_id == verb))
        .or_else(|| match api.operations.as_slice() {
            [only] => Some(only),
            _ => None,
        })
}

fn fill_path<'a>(
    operation: &'a ApiOperation,
    inputs: &'a HashMap<String, InputValue>,
    consumed: &mut HashSet<&'a str>,
    trace_id: &str,
) -> EngineResult<String> {
    let mut path = operation.path.clone();
    for parameter in &operation.parameters {
        if parameter.location != ApiParameterLocation::Path {
            continue;
        }
        let input_name = parameter.input.as_deref().unwrap_or(&parameter.name);
        let placeholder = format!("{{{}}}", parameter.name);
        let input = inputs.get(input_name).ok_or_else(|| {
            StructuredError::report(
                ErrorCode::InvalidInput,
                COMPONENT,
                format!(
                    "path parameter {} of {} has no input",
                    parameter.name, operation.operation_id
                ),
            )
            .trace(trace_id)
            .build()
        })?;
        if let Some((key, _)) = inputs.get_key_value(input_name) {
            consumed.insert(key.as_str());
        }
        path = path.replace(&placeholder, &query_text(&input.value));
    }
    Ok(path)
}

/// Scalar inputs render bare; containers render as compact JSON.
fn query_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn apply_auth(
    request: reqwest::RequestBuilder,
    auth: &ApiAuth,
    trace_id: &str,
) -> EngineResult<reqwest::RequestBuilder> {
    let missing = |what: &str| {
        StructuredError::report(
            ErrorCode::AuthenticationFailed,
            COMPONENT,
            format!("{what} credential did not resolve"),
        )
        .trace(trace_id)
        .build()
    };
    Ok(match auth {
        ApiAuth::None => request,
        ApiAuth::ApiKey { header, credential } => {
            let value = resolve_credential(credential).ok_or_else(|| missing("api-key"))?;
            request.header(header.as_str(), value)
        }
        ApiAuth::Bearer { credential } => {
            let value = resolve_credential(credential).ok_or_else(|| missing("bearer"))?;
            request.bearer_auth(value)
        }
        ApiAuth::Basic {
            username_credential,
            password_credential,
        } => {
            let user =
                resolve_credential(username_credential).ok_or_else(|| missing("basic username"))?;
            let password = resolve_credential(password_credential);
            request.basic_auth(user, password)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{
        ApiParameter, HandlerKind, HostCompatibility, PackageSource, SecurityConfig,
    };
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn api_manifest(base_url: &str, operations: Vec<ApiOperation>, auth: ApiAuth) -> PluginManifest {
        PluginManifest {
            id: "plugin-FETCH".to_string(),
            verb: "FETCH".to_string(),
            version: semver::Version::parse("1.0.0").unwrap(),
            handler: HandlerKind::OpenApi {
                api: ApiConfig {
                    base_url: base_url.to_string(),
                    operations,
                    auth,
                    timeout_secs: 10,
                },
            },
            description: String::new(),
            categories: Vec::new(),
            entry_point: None,
            input_definitions: Vec::new(),
            output_definitions: Vec::new(),
            package_source: PackageSource::default(),
            security: SecurityConfig::default(),
            host_compatibility: HostCompatibility::default(),
        }
    }

    fn api_of(manifest: &PluginManifest) -> &ApiConfig {
        match &manifest.handler {
            HandlerKind::OpenApi { api } => api,
            _ => unreachable!(),
        }
    }

    fn inputs(entries: &[(&str, serde_json::Value)]) -> HashMap<String, InputValue> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), InputValue::new(*k, v.clone())))
            .collect()
    }

    #[tokio::test]
    async fn maps_path_query_and_body_parameters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/items/42/search"))
            .and(query_param("limit", "5"))
            .and(body_partial_json(serde_json::json!({"query": "rust"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"hits": [1, 2]})),
            )
            .mount(&server)
            .await;

        let manifest = api_manifest(
            &server.uri(),
            vec![ApiOperation {
                operation_id: "searchItems".to_string(),
                action_verb: Some("FETCH".to_string()),
                method: "post".to_string(),
                path: "/items/{itemId}/search".to_string(),
                parameters: vec![
                    ApiParameter {
                        name: "itemId".to_string(),
                        location: ApiParameterLocation::Path,
                        input: Some("item_id".to_string()),
                    },
                    ApiParameter {
                        name: "limit".to_string(),
                        location: ApiParameterLocation::Query,
                        input: None,
                    },
                    ApiParameter {
                        name: "query".to_string(),
                        location: ApiParameterLocation::Body,
                        input: None,
                    },
                ],
            }],
            ApiAuth::None,
        );

        let outputs = execute(
            &reqwest::Client::new(),
            &manifest,
            api_of(&manifest),
            &inputs(&[
                ("item_id", serde_json::json!(42)),
                ("limit", serde_json::json!("5")),
                ("query", serde_json::json!("rust")),
            ]),
            Duration::from_secs(30),
            "t-1",
        )
        .await
        .unwrap();

        assert_eq!(outputs.len(), 3);
        assert!(outputs[0].success);
        assert_eq!(outputs[0].name, "searchItems");
        assert_eq!(outputs[0].result, serde_json::json!({"hits": [1, 2]}));
        assert_eq!(outputs[0].result_type, ValueType::Object);
        assert_eq!(outputs[1].name, "statusCode");
        assert_eq!(outputs[1].result, serde_json::json!(200));
        assert_eq!(outputs[2].name, "responseTime");
    }

    #[tokio::test]
    async fn bearer_auth_is_applied_from_env_reference() {
        std::env::set_var("CAPMAN_TEST_BEARER", "tok-123");
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/whoami"))
            .and(header("authorization", "Bearer tok-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let manifest = api_manifest(
            &server.uri(),
            vec![ApiOperation {
                operation_id: "whoami".to_string(),
                action_verb: None,
                method: "GET".to_string(),
                path: "/whoami".to_string(),
                parameters: Vec::new(),
            }],
            ApiAuth::Bearer {
                credential: "env:CAPMAN_TEST_BEARER".to_string(),
            },
        );

        let outputs = execute(
            &reqwest::Client::new(),
            &manifest,
            api_of(&manifest),
            &HashMap::new(),
            Duration::from_secs(30),
            "t-1",
        )
        .await
        .unwrap();
        std::env::remove_var("CAPMAN_TEST_BEARER");
        assert!(outputs[0].success);
    }

    #[tokio::test]
    async fn non_success_statuses_become_failed_outputs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(serde_json::json!({"error": "nope"})),
            )
            .mount(&server)
            .await;

        let manifest = api_manifest(
            &server.uri(),
            vec![ApiOperation {
                operation_id: "getMissing".to_string(),
                action_verb: None,
                method: "GET".to_string(),
                path: "/missing".to_string(),
                parameters: Vec::new(),
            }],
            ApiAuth::None,
        );

        let outputs = execute(
            &reqwest::Client::new(),
            &manifest,
            api_of(&manifest),
            &HashMap::new(),
            Duration::from_secs(30),
            "t-1",
        )
        .await
        .unwrap();
        assert!(!outputs[0].success);
        assert_eq!(outputs[0].result_type, ValueType::Error);
        assert_eq!(outputs[1].result, serde_json::json!(404));
    }

    #[tokio::test]
    async fn missing_operation_is_an_error() {
        let manifest = api_manifest("http://127.0.0.1:1", Vec::new(), ApiAuth::None);
        let err = execute(
            &reqwest::Client::new(),
            &manifest,
            api_of(&manifest),
            &HashMap::new(),
            Duration::from_secs(30),
            "t-1",
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ApiOperationNotFound);
    }
}
