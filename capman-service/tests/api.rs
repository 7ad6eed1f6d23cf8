//! End-to-end tests over the HTTP surface: register handlers, execute
//! steps, and check the failure contract, against a server running on
//! temporary directories.

use axum::http::StatusCode;
use axum_test::TestServer;
use capman_service::config::Config;
use capman_service::create_server;
use serde_json::json;

struct Harness {
    server: TestServer,
    dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.registry.plugin_root = dir.path().join("plugins");
    config.registry.cache_root = dir.path().join("cache");
    config.registry.manifest_root = dir.path().join("manifests");
    let (app, _state) = create_server(config).await.unwrap();
    Harness {
        server: TestServer::new(app).unwrap(),
        dir,
    }
}

/// Drop a script bundle under the inline plugin root.
fn write_bundle(harness: &Harness, verb: &str, file: &str, contents: &str) {
    let dir = harness.dir.path().join("plugins").join(verb);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(file), contents).unwrap();
}

#[tokio::test]
async fn internal_verb_executes_end_to_end() {
    let h = harness().await;

    let stored = h
        .server
        .post("/plugins")
        .json(&json!({
            "id": "plugin-CHAT",
            "verb": "CHAT",
            "version": "1.0.0",
            "language": "internal"
        }))
        .await;
    assert_eq!(stored.status_code(), StatusCode::CREATED);

    let response = h
        .server
        .post("/executeAction")
        .json(&json!({ "actionVerb": "CHAT" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let outputs = response.json::<serde_json::Value>();
    assert_eq!(outputs.as_array().unwrap().len(), 1);
    assert_eq!(outputs[0]["success"], true);
    assert_eq!(outputs[0]["name"], "internal_verb_detected");
    assert_eq!(outputs[0]["resultType"], "string");
    assert_eq!(outputs[0]["result"], "INTERNAL_VERB");
}

#[tokio::test]
async fn aliases_map_before_the_script_runs() {
    let h = harness().await;
    // The script echoes what it received under the canonical names.
    write_bundle(
        &h,
        "TRANSFORM",
        "main.js",
        r#"
        [{
            "success": true,
            "name": "transformed",
            "resultType": "object",
            "result": { "script": inputs.script, "params": inputs.script_parameters },
            "resultDescription": "echo of canonical inputs"
        }]
        "#,
    );

    let stored = h
        .server
        .post("/plugins")
        .json(&json!({
            "id": "plugin-TRANSFORM",
            "verb": "TRANSFORM",
            "version": "1.0.0",
            "language": "sandbox-script",
            "entryPoint": { "main": "main.js" },
            "inputDefinitions": [
                { "name": "script", "type": "string", "required": true, "aliases": ["code"] },
                { "name": "script_parameters", "type": "object", "aliases": ["params"] }
            ]
        }))
        .await;
    assert_eq!(stored.status_code(), StatusCode::CREATED);

    let response = h
        .server
        .post("/executeAction")
        .json(&json!({
            "actionVerb": "TRANSFORM",
            "inputValues": {
                "code": {
                    "inputName": "code",
                    "value": "print('hello')",
                    "valueType": "string"
                },
                "params": {
                    "inputName": "params",
                    "value": { "k": "v" },
                    "valueType": "object"
                }
            }
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let outputs = response.json::<serde_json::Value>();
    assert_eq!(outputs[0]["result"]["script"], "print('hello')");
    assert_eq!(outputs[0]["result"]["params"], json!({ "k": "v" }));
}

#[tokio::test]
async fn version_selection_skips_incompatible_releases() {
    let h = harness().await;

    // Host runs 1.0.0 by default; 1.0.0 of the plugin wants a 2.x host
    // and would fail outright if it were ever selected (its entry point
    // does not exist).
    let newer = h
        .server
        .post("/plugins")
        .json(&json!({
            "id": "plugin-X",
            "verb": "X",
            "version": "1.0.0",
            "language": "sandbox-script",
            "entryPoint": { "main": "missing.js" },
            "hostCompatibility": { "minHostVersion": "2.0.0" }
        }))
        .await;
    assert_eq!(newer.status_code(), StatusCode::CREATED);

    let older = h
        .server
        .post("/plugins")
        .json(&json!({
            "id": "plugin-X",
            "verb": "X",
            "version": "0.9.0",
            "language": "internal",
            "hostCompatibility": { "minHostVersion": "0.5.0" }
        }))
        .await;
    assert_eq!(older.status_code(), StatusCode::CREATED);

    let response = h
        .server
        .post("/executeAction")
        .json(&json!({ "actionVerb": "X" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let outputs = response.json::<serde_json::Value>();
    assert_eq!(outputs[0]["result"], "INTERNAL_VERB");
}

#[tokio::test]
async fn unknown_verbs_are_planned_once_and_cached() {
    let h = harness().await;
    write_bundle(
        &h,
        "ACCOMPLISH",
        "main.sh",
        r#"cat > /dev/null
echo x >> calls.txt
printf '[{"success": true, "name": "plan", "resultType": "plan", "result": [{"number": 1, "actionVerb": "SEARCH", "description": "look it up"}], "resultDescription": "a plan"}]'
"#,
    );

    let stored = h
        .server
        .post("/plugins")
        .json(&json!({
            "id": "plugin-ACCOMPLISH",
            "verb": "ACCOMPLISH",
            "version": "1.0.0",
            "language": "subprocess-script",
            "runtime": { "interpreter": "sh", "requirementsFile": "requirements.txt" },
            "entryPoint": { "main": "main.sh" }
        }))
        .await;
    assert_eq!(stored.status_code(), StatusCode::CREATED);

    let first = h
        .server
        .post("/executeAction")
        .json(&json!({ "actionVerb": "NOVEL_VERB" }))
        .await;
    assert_eq!(first.status_code(), StatusCode::OK);
    let first_body = first.json::<serde_json::Value>();
    assert_eq!(first_body[0]["resultType"], "plan");
    assert_eq!(first_body[0]["result"][0]["actionVerb"], "SEARCH");

    let second = h
        .server
        .post("/executeAction")
        .json(&json!({ "actionVerb": "NOVEL_VERB" }))
        .await;
    assert_eq!(second.status_code(), StatusCode::OK);
    assert_eq!(second.json::<serde_json::Value>()[0]["result"], first_body[0]["result"]);

    // The meta-handler ran exactly once; the second request hit the cache.
    let calls = std::fs::read_to_string(
        h.dir.path().join("plugins").join("ACCOMPLISH").join("calls.txt"),
    )
    .unwrap();
    assert_eq!(calls.lines().count(), 1);
}

#[tokio::test]
async fn unknown_verb_without_meta_handler_returns_the_failure_shape() {
    let h = harness().await;

    let response = h
        .server
        .post("/executeAction")
        .json(&json!({ "actionVerb": "NOBODY_HOME" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

    let body = response.json::<serde_json::Value>();
    let outputs = body.as_array().unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0]["success"], false);
    assert_eq!(outputs[0]["resultType"], "error");
    assert_eq!(outputs[0]["name"], "ACCOMPLISH_PLUGIN_MANIFEST_NOT_FOUND");
    assert_eq!(
        outputs[0]["result"]["error_code"],
        "ACCOMPLISH_PLUGIN_MANIFEST_NOT_FOUND"
    );
}

#[tokio::test]
async fn plugin_crud_round_trip() {
    let h = harness().await;

    let stored = h
        .server
        .post("/plugins")
        .json(&json!({
            "id": "plugin-ECHO",
            "verb": "ECHO",
            "version": "1.0.0",
            "language": "internal",
            "description": "repeats things back"
        }))
        .await;
    assert_eq!(stored.status_code(), StatusCode::CREATED);
    let outcome = stored.json::<serde_json::Value>();
    assert_eq!(outcome["pluginId"], "plugin-ECHO");
    assert_eq!(outcome["isUpdate"], false);

    // Same (id, version) again counts as an update.
    let again = h
        .server
        .post("/plugins")
        .json(&json!({
            "id": "plugin-ECHO",
            "verb": "ECHO",
            "version": "1.0.0",
            "language": "internal"
        }))
        .await;
    assert_eq!(again.status_code(), StatusCode::OK);
    assert_eq!(again.json::<serde_json::Value>()["isUpdate"], true);

    let listed = h.server.get("/plugins").await;
    assert_eq!(listed.status_code(), StatusCode::OK);
    let plugins = listed.json::<serde_json::Value>();
    assert_eq!(plugins["plugins"].as_array().unwrap().len(), 1);
    assert_eq!(plugins["plugins"][0]["verb"], "ECHO");

    let fetched = h.server.get("/plugins/plugin-ECHO").await;
    assert_eq!(fetched.status_code(), StatusCode::OK);
    assert_eq!(fetched.json::<serde_json::Value>()["description"], "repeats things back");

    let deleted = h.server.delete("/plugins/plugin-ECHO").await;
    assert_eq!(deleted.status_code(), StatusCode::OK);

    let gone = h.server.get("/plugins/plugin-ECHO").await;
    assert_eq!(gone.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(
        gone.json::<serde_json::Value>()["error"]["error_code"],
        "PLUGIN_NOT_FOUND"
    );
}

#[tokio::test]
async fn invalid_manifests_are_rejected_with_400() {
    let h = harness().await;

    // Non-remote language without an entry point.
    let response = h
        .server
        .post("/plugins")
        .json(&json!({
            "id": "plugin-BAD",
            "verb": "BAD",
            "version": "1.0.0",
            "language": "sandbox-script"
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.json::<serde_json::Value>()["error"]["error_code"],
        "PLUGIN_MANIFEST_INVALID"
    );

    // Disallowed permission.
    let response = h
        .server
        .post("/plugins")
        .json(&json!({
            "id": "plugin-SPOOKY",
            "verb": "SPOOKY",
            "version": "1.0.0",
            "language": "internal",
            "security": { "permissions": ["kernel.reboot"] }
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response.json::<serde_json::Value>()["error"]["error_code"],
        "PLUGIN_PERMISSION_VALIDATION_FAILED"
    );
}

#[tokio::test]
async fn empty_action_verb_is_a_400() {
    let h = harness().await;
    let response = h
        .server
        .post("/executeAction")
        .json(&json!({ "actionVerb": "  " }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn context_generation_ranks_registered_plugins() {
    let h = harness().await;
    for (verb, description) in [
        ("SEARCH", "search the web for documents and articles"),
        ("RESIZE", "resize and crop images"),
    ] {
        let stored = h
            .server
            .post("/plugins")
            .json(&json!({
                "id": format!("plugin-{verb}"),
                "verb": verb,
                "version": "1.0.0",
                "language": "internal",
                "description": description
            }))
            .await;
        assert_eq!(stored.status_code(), StatusCode::CREATED);
    }

    let response = h
        .server
        .post("/generatePluginContext")
        .json(&json!({
            "goal": "search the web for rust articles",
            "constraints": { "maxPlugins": 1, "maxTokens": 500 }
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let context = response.json::<serde_json::Value>();
    assert_eq!(context["plugins"].as_array().unwrap().len(), 1);
    assert_eq!(context["plugins"][0]["verb"], "SEARCH");
    assert!(context["text"].as_str().unwrap().starts_with("- SEARCH:"));
}

#[tokio::test]
async fn statistics_reflect_executions() {
    let h = harness().await;
    h.server
        .post("/plugins")
        .json(&json!({
            "id": "plugin-CHAT",
            "verb": "CHAT",
            "version": "1.0.0",
            "language": "internal"
        }))
        .await;

    for _ in 0..3 {
        let response = h
            .server
            .post("/executeAction")
            .json(&json!({ "actionVerb": "CHAT" }))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    let stats = h.server.get("/statistics").await.json::<serde_json::Value>();
    let plugins = stats["plugins"].as_array().unwrap();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0]["pluginId"], "plugin-CHAT");
    assert_eq!(plugins[0]["totalUses"], 3);
}
