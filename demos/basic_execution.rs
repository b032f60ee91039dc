//! Basic example of running analysis scripts in the sandbox.
//!
//! Run with: cargo run --example basic_execution
//!
//! Note: Requires `python3` on PATH.

use analysis_sandbox_rs::prelude::*;
use serde_json::json;

fn report(title: &str, result: &ExecutionResult) {
    println!("\n=== {} ===", title);
    println!("success: {}", result.success);
    if let Some(output) = &result.output {
        println!("output: {}", output);
    }
    if let Some(error) = &result.error {
        println!("error ({:?}): {}", result.error_kind, error);
    }
    if !result.stderr.is_empty() {
        println!("stderr:\n{}", result.stderr.trim_end());
    }
    println!("duration: {} ms", result.execution_time_ms);
}

#[tokio::main]
async fn main() -> Result<()> {
    let manager = SandboxFactory::new().analysis()?;
    println!("Policy: {:?}", manager.policy());

    let mut context = Context::new();
    context
        .insert("closes", json!([101.2, 99.8, 103.5, 104.1, 102.7, 106.0]))?
        .insert(
            "trades",
            json!([
                {"desk": "rates", "pnl": 1200},
                {"desk": "fx", "pnl": -300},
                {"desk": "rates", "pnl": 450},
            ]),
        )?;

    let result = manager.execute("result = 2 + 2", &Context::new()).await;
    report("Simple arithmetic", &result);

    let script = r#"
from safe_data import SafeArray
closes_array = SafeArray(closes)
print("computing returns")
result = {
    "mean": closes_array.mean(),
    "p90": closes_array.percentile(90),
    "returns": closes_array.pct_change().to_list(),
}
"#;
    let result = manager.execute(script, &context).await;
    report("SafeArray statistics", &result);

    let script = r#"
from safe_data import SafeTable
result = SafeTable(trades).groupby("desk").sum("pnl")
"#;
    let result = manager.execute(script, &context).await;
    report("SafeTable groupby", &result);

    let script = "import os\nresult = os.system('ls')";
    let findings = manager.validate_code(script);
    println!("\nvalidate_code tokens: {:?}", findings.tokens());
    let result = manager.execute(script, &Context::new()).await;
    report("Denied import", &result);

    let result = manager
        .execute("raise ValueError('test error')", &Context::new())
        .await;
    report("Python error", &result);

    Ok(())
}
