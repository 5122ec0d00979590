//! The LSP transport end to end: `typedown/loadProject`
//! hydrates a virtual workspace, an unsaved `didChange` edit is diagnosed
//! within the debounce window, and a follow-up edit clears it without
//! leaking diagnostics onto an unrelated file.

mod common;

use common::lsp_client::{file_uri, TestClient};

const USER_MODEL: &str = "```model:User\nrecord User { name: str }\n```\n";

fn alice_valid() -> &'static str {
    "```entity User: alice\nname: Alice\n```\n"
}

fn alice_with_bad_reference() -> &'static str {
    "```entity User: alice\nname: Alice\nmentor: \"[[nobody]]\"\n```\n"
}

/// Drains `publishDiagnostics` notifications until one names `uri`,
/// asserting every other notification seen along the way reports no
/// diagnostics (so a sibling file's edit can't have leaked into them).
async fn next_clean_publish_for(client: &mut TestClient, uri: &str) -> serde_json::Value {
    loop {
        let msg = client
            .recv_notification("textDocument/publishDiagnostics")
            .await;
        if msg["params"]["uri"].as_str() == Some(uri) {
            return msg;
        }
        assert!(
            msg["params"]["diagnostics"].as_array().unwrap().is_empty(),
            "unexpected diagnostics on unrelated file: {msg}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn unsaved_edit_reports_and_then_clears_e0341_without_cross_file_leakage() {
    let mut client = TestClient::new();
    client.initialize().await;

    let root = "/virtual/project";
    let alice_uri = file_uri(&format!("{root}/entities/alice.td"));

    client
        .load_project(
            root,
            serde_json::json!({
                format!("{root}/typedown.toml"): "",
                format!("{root}/models/user.td"): USER_MODEL,
                format!("{root}/entities/alice.td"): alice_valid(),
                format!("{root}/entities/bob.td"): "```entity User: bob\nname: Bob\n```\n",
            }),
        )
        .await;

    // loadProject compiles and publishes immediately for every document;
    // the project is clean, so alice's own publish (among the others) is
    // empty too.
    let published = next_clean_publish_for(&mut client, &alice_uri).await;
    assert!(published["params"]["diagnostics"]
        .as_array()
        .unwrap()
        .is_empty());

    // Edit alice.td in place to reference a nonexistent entity.
    client
        .did_change(&alice_uri, 2, alice_with_bad_reference())
        .await;
    tokio::time::advance(std::time::Duration::from_millis(600)).await;

    let published = next_clean_publish_for(&mut client, &alice_uri).await;
    let diagnostics = published["params"]["diagnostics"].as_array().unwrap();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0]["code"], "E0341");

    // Fix the reference; the diagnostic should clear on the next debounce,
    // and bob.td (never touched) still reports nothing along the way.
    client.did_change(&alice_uri, 3, alice_valid()).await;
    tokio::time::advance(std::time::Duration::from_millis(600)).await;

    let published = next_clean_publish_for(&mut client, &alice_uri).await;
    assert!(published["params"]["diagnostics"]
        .as_array()
        .unwrap()
        .is_empty());

    client.shutdown().await;
}

/// A `didChange` superseded by a second edit within the 500ms debounce
/// window never surfaces the stale, superseded-version compile: the first
/// `alice.td` diagnostics the client observes after both edits already
/// reflect the final one, not the transient broken one.
#[tokio::test(start_paused = true)]
async fn rapid_edits_coalesce_into_a_single_publish() {
    let mut client = TestClient::new();
    client.initialize().await;

    let root = "/virtual/coalesce";
    let alice_uri = file_uri(&format!("{root}/entities/alice.td"));

    client
        .load_project(
            root,
            serde_json::json!({
                format!("{root}/typedown.toml"): "",
                format!("{root}/models/user.td"): USER_MODEL,
                format!("{root}/entities/alice.td"): alice_valid(),
            }),
        )
        .await;
    next_clean_publish_for(&mut client, &alice_uri).await;

    client
        .did_change(&alice_uri, 2, alice_with_bad_reference())
        .await;
    tokio::time::advance(std::time::Duration::from_millis(100)).await;
    client.did_change(&alice_uri, 3, alice_valid()).await;
    tokio::time::advance(std::time::Duration::from_millis(600)).await;

    let published = next_clean_publish_for(&mut client, &alice_uri).await;
    assert!(published["params"]["diagnostics"]
        .as_array()
        .unwrap()
        .is_empty());

    client.shutdown().await;
}
