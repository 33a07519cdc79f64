//! Demo actions registered on the worker so the service can be exercised end to end.

use rand::Rng;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::info;

use retrier_infra::runs::RetryOptions;
use retrier_infra::scheduler::{FunctionRef, SchedulerWorker};

pub const MY_ACTION: &str = "example.my_action";
pub const COMPLETION: &str = "example.completion";

/// Probability that `"fail randomly"` fails.
const RANDOM_FAILURE_RATE: f64 = 0.8;

#[derive(Debug, Deserialize)]
struct MyActionArgs {
    action: String,
}

/// `{"action": "succeed" | "fail randomly" | "fail always"}`
pub fn my_action(args: &JsonValue) -> Result<JsonValue, String> {
    let MyActionArgs { action } =
        serde_json::from_value(args.clone()).map_err(|e| format!("invalid args: {e}"))?;

    match action.as_str() {
        "succeed" => {
            info!("success");
            Ok(JsonValue::Null)
        }
        "fail randomly" => {
            if rand::thread_rng().r#gen::<f64>() < RANDOM_FAILURE_RATE {
                return Err("action failed.".to_string());
            }
            info!("action succeeded.");
            Ok(JsonValue::Null)
        }
        "fail always" => Err("action failed.".to_string()),
        _ => Err("invalid action".to_string()),
    }
}

/// Completion callback: logs the result it receives.
pub fn completion(args: &JsonValue) -> Result<JsonValue, String> {
    info!(run_id = %args["run_id"], result = %args["result"], "run completed");
    Ok(JsonValue::Null)
}

pub fn register(worker: &mut SchedulerWorker) {
    worker.register_handler(MY_ACTION, my_action);
    worker.register_handler(COMPLETION, completion);
}

/// Options used by the kickoff endpoint: three tries, one second apart and doubling.
pub fn kickoff_options() -> RetryOptions {
    RetryOptions::default()
        .with_initial_backoff_ms(1000.0)
        .with_base(2.0)
        .with_max_failures(2)
        .on_complete(FunctionRef::new(COMPLETION))
}
