use serde_json::Value;

/// Render the `/status` response as human-readable text.
pub fn render_status(status: &Value) -> String {
    let mut out = String::new();
    if let Some(count) = status.get("runner_count").and_then(|v| v.as_u64()) {
        out.push_str(&format!("Runners: {}\n", count));
    }
    if let Some(by_state) = status.get("by_state").and_then(|v| v.as_object()) {
        for (state, count) in by_state {
            out.push_str(&format!("  {:<20} {}\n", state, count));
        }
    }
    if let Some(pools) = status.get("pools").and_then(|v| v.as_array()) {
        out.push_str("\nPools:\n");
        for pool in pools {
            let image_id = pool.get("image_id").and_then(|v| v.as_str()).unwrap_or("-");
            let pool_size = pool.get("pool_size").and_then(|v| v.as_u64()).unwrap_or(0);
            let ready = pool.get("ready_count").and_then(|v| v.as_u64()).unwrap_or(0);
            out.push_str(&format!("  {:<20} ready {}/{}\n", image_id, ready, pool_size));
        }
    }
    out
}

/// Render a runner list as a table.
pub fn render_runners(runners: &Value) -> String {
    let Some(runners) = runners.as_array() else {
        return "No runners.".to_string();
    };
    if runners.is_empty() {
        return "No runners.".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!("{:<38} {:<20} {:<12} {}\n", "ID", "STATE", "IMAGE", "USER"));
    out.push_str(&"-".repeat(90));
    out.push('\n');
    for r in runners {
        let id = r.get("id").and_then(|v| v.as_str()).unwrap_or("-");
        let state = r.get("state").and_then(|v| v.as_str()).unwrap_or("-");
        let image_id = r.get("image_id").and_then(|v| v.as_str()).unwrap_or("-");
        let user_id = r.get("user_id").and_then(|v| v.as_str()).unwrap_or("-");
        out.push_str(&format!("{:<38} {:<20} {:<12} {}\n", id, state, image_id, user_id));
    }
    out
}
