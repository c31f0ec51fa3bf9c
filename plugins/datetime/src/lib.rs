use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use kora_shared::{kora_plugin, Plugin, PluginConfig, PluginDescriptor, PluginInvocation, ToolSpec};
use serde::Deserialize;
use serde_json::{json, Value};

#[kora_plugin(
    id = "core.datetime",
    name = "Date & Time",
    description = "Clock and calendar arithmetic tools.",
    version = "0.1.0",
    capabilities = ["tools.function"],
    tools = ["datetime.now", "datetime.shift", "datetime.diff"]
)]
pub struct DateTimePlugin;

impl DateTimePlugin {
    pub async fn new_plugin(_config: PluginConfig) -> anyhow::Result<Self> {
        Ok(Self)
    }
}

#[derive(Deserialize)]
struct NowArgs {
    #[serde(default)]
    offset_minutes: i32,
}

#[derive(Deserialize)]
struct ShiftArgs {
    timestamp: String,
    seconds: i64,
}

#[derive(Deserialize)]
struct DiffArgs {
    from: String,
    to: String,
}

fn parse_ts(raw: &str) -> anyhow::Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw)
        .map_err(|e| anyhow::anyhow!("'{}' is not an RFC 3339 timestamp: {}", raw, e))
}

fn now(args: NowArgs) -> anyhow::Result<Value> {
    // ±14h covers every real-world zone
    if args.offset_minutes.abs() > 14 * 60 {
        anyhow::bail!("offset_minutes must be within ±840 (got {})", args.offset_minutes);
    }
    let offset = FixedOffset::east_opt(args.offset_minutes * 60)
        .ok_or_else(|| anyhow::anyhow!("invalid offset"))?;
    let now = Utc::now().with_timezone(&offset);
    Ok(json!({
        "iso": now.to_rfc3339(),
        "unix": now.timestamp(),
        "weekday": now.format("%A").to_string(),
    }))
}

fn shift(args: ShiftArgs) -> anyhow::Result<Value> {
    let ts = parse_ts(&args.timestamp)?;
    let delta = Duration::try_seconds(args.seconds)
        .ok_or_else(|| anyhow::anyhow!("seconds out of range"))?;
    let shifted = ts
        .checked_add_signed(delta)
        .ok_or_else(|| anyhow::anyhow!("resulting timestamp is out of range"))?;
    Ok(json!({ "iso": shifted.to_rfc3339() }))
}

fn diff(args: DiffArgs) -> anyhow::Result<Value> {
    let from = parse_ts(&args.from)?;
    let to = parse_ts(&args.to)?;
    let seconds = (to - from).num_seconds();
    Ok(json!({ "seconds": seconds, "days": seconds as f64 / 86_400.0 }))
}

#[async_trait]
impl Plugin for DateTimePlugin {
    fn descriptor(&self) -> PluginDescriptor {
        let mut descriptor = Self::static_descriptor();
        descriptor.provided_tools = vec![
            ToolSpec::new("datetime.now", "Current time, optionally at a UTC offset.").with_schema(json!({
                "type": "object",
                "properties": { "offset_minutes": { "type": "integer" } }
            })),
            ToolSpec::new("datetime.shift", "Add seconds to an RFC 3339 timestamp.").with_schema(json!({
                "type": "object",
                "properties": {
                    "timestamp": { "type": "string" },
                    "seconds": { "type": "integer" }
                },
                "required": ["timestamp", "seconds"]
            })),
            ToolSpec::new("datetime.diff", "Seconds between two RFC 3339 timestamps.").with_schema(json!({
                "type": "object",
                "properties": {
                    "from": { "type": "string" },
                    "to": { "type": "string" }
                },
                "required": ["from", "to"]
            })),
        ];
        descriptor
    }

    async fn execute(&self, invocation: PluginInvocation) -> anyhow::Result<Value> {
        let params = if invocation.parameters.is_null() {
            json!({})
        } else {
            invocation.parameters
        };
        match invocation.operation.as_str() {
            "datetime.now" => now(serde_json::from_value(params)?),
            "datetime.shift" => shift(serde_json::from_value(params)?),
            "datetime.diff" => diff(serde_json::from_value(params)?),
            other => anyhow::bail!("unknown datetime operation '{}'", other),
        }
    }
}
