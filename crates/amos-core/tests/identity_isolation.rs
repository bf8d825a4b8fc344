//! Context propagation: usage must attribute to the correct logical agent
//! under arbitrary task interleaving.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Map;

use amos_core::identity::ExecutionContext;
use amos_core::ledger::BudgetLedger;

#[tokio::test]
async fn test_concurrent_children_never_cross_attribute_usage() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(
        BudgetLedger::open(dir.path().join("usage.jsonl"), HashMap::new()).unwrap(),
    );

    // One parent spawns eight children with distinct identities; each child
    // logs a distinctive amount several times, interleaved at the runtime's
    // whim.
    let contexts: Vec<ExecutionContext> =
        (0..8).map(|_| ExecutionContext::spawn("debater")).collect();

    let mut handles = Vec::new();
    for (i, ctx) in contexts.iter().enumerate() {
        let ledger = Arc::clone(&ledger);
        let ctx = ctx.clone();
        let tokens = (i as u64 + 1) * 10;
        handles.push(tokio::spawn(async move {
            for _ in 0..5 {
                ledger
                    .check_and_append(&ctx, tokens, 0.0, Map::new())
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Each identity's total reflects exactly its own calls.
    for (i, ctx) in contexts.iter().enumerate() {
        let totals = ledger.totals(ctx.identity().as_str()).await;
        assert_eq!(
            totals.tokens,
            (i as u64 + 1) * 10 * 5,
            "identity {} accumulated a sibling's spend",
            ctx.identity()
        );
    }
}

#[tokio::test]
async fn test_calls_without_an_established_context_aggregate_at_role_level() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Arc::new(
        BudgetLedger::open(dir.path().join("usage.jsonl"), HashMap::new()).unwrap(),
    );

    // The fallback context uses the role name itself as the identity.
    let ctx = ExecutionContext::role_level("technomancer");
    ledger.append(&ctx, 100, 0.01, Map::new()).await.unwrap();
    ledger.append(&ctx, 200, 0.02, Map::new()).await.unwrap();

    let totals = ledger.totals("technomancer").await;
    assert_eq!(totals.tokens, 300);
}
