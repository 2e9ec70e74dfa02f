use serde_json::Value;

/// Print just the headline value of a command.
///
/// Looks for the headline field of each command in priority order, then
/// falls back to the first field in the result object.
pub fn print_minimal(value: &Value) {
    let result_obj = value
        .as_object()
        .and_then(|m| m.get("result"))
        .unwrap_or(value);

    // Single trial reports nest their numbers under "metrics"
    let result_obj = result_obj.get("metrics").unwrap_or(result_obj);

    // Sweep summaries: mean IRR of the base outer trial
    if let Some(Value::Array(rows)) = result_obj.get("outer_trials") {
        if let Some(mean) = rows.first().and_then(|r| r.get("mean_irr")) {
            println!("{}", format_minimal(mean));
            return;
        }
    }

    let priority_keys = [
        "valid",
        "fund_irr",
        "mean_irr",
        "sponsor_promote",
        "status",
    ];

    if let Value::Object(map) = result_obj {
        for key in &priority_keys {
            if let Some(val) = map.get(*key) {
                if !val.is_null() {
                    println!("{}", format_minimal(val));
                    return;
                }
            }
        }

        if let Some((key, val)) = map.iter().next() {
            println!("{}: {}", key, format_minimal(val));
            return;
        }
    }

    println!("{}", format_minimal(result_obj));
}

fn format_minimal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        _ => serde_json::to_string(value).unwrap_or_default(),
    }
}
