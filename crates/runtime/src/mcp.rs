//! MCP auto-reload triggers.
//!
//! When a tool call touches an MCP-looking path (`mcp.json`,
//! `mcp.exm.json`, anything under an `mcp/` directory, or a `bin/`
//! entry whose basename mentions mcp), the turn loop schedules one
//! reload at the end of the current model step. Natural-language reload
//! requests are recognized separately, outside the model loop.

use async_trait::async_trait;

use hm_domain::Result;

/// The explicit reload tool; calling it does not re-trigger itself.
pub const MCP_RELOAD_TOOL: &str = "mcp_reload";

/// Capability seam to the MCP tool-set manager (wire protocol out of
/// scope). Returns a short human-readable status on success.
#[async_trait]
pub trait McpReloader: Send + Sync {
    async fn reload(&self) -> Result<String>;
}

/// Natural-language reload requests, English and Chinese.
const RELOAD_PHRASES: &[&str] = &[
    "reload mcp",
    "mcp reload",
    "reload the mcp",
    "refresh mcp",
    "restart mcp",
    "重新加载mcp",
    "重载mcp",
    "刷新mcp",
    "重启mcp",
];

/// Whether free text asks for an MCP reload.
pub fn text_requests_reload(text: &str) -> bool {
    let lower = text.to_lowercase();
    RELOAD_PHRASES.iter().any(|p| lower.contains(p))
}

/// Whether a path string looks MCP-related.
pub fn is_mcp_related_path(raw: &str) -> bool {
    let normalized = raw.replace('\\', "/");
    let components: Vec<&str> = normalized
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    let Some(basename) = components.last() else {
        return false;
    };

    if *basename == "mcp.json" || *basename == "mcp.exm.json" {
        return true;
    }
    // Any path under an mcp/ directory.
    if components[..components.len() - 1].iter().any(|c| *c == "mcp") {
        return true;
    }
    // A binary in bin/ whose name mentions mcp.
    if components.len() >= 2
        && components[components.len() - 2] == "bin"
        && basename.to_lowercase().contains("mcp")
    {
        return true;
    }
    false
}

/// Universal argument inspector: walk every string value in a duck-typed
/// JSON argument object and report whether any looks like an MCP path.
pub fn args_touch_mcp_paths(args: &serde_json::Value) -> bool {
    match args {
        serde_json::Value::String(s) => is_mcp_related_path(s),
        serde_json::Value::Array(items) => items.iter().any(args_touch_mcp_paths),
        serde_json::Value::Object(map) => map.values().any(args_touch_mcp_paths),
        _ => false,
    }
}

/// Whether this tool call should schedule an auto-reload.
pub fn call_triggers_reload(tool_name: &str, args: &serde_json::Value) -> bool {
    tool_name != MCP_RELOAD_TOOL && args_touch_mcp_paths(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mcp_config_files_match() {
        assert!(is_mcp_related_path("mcp.json"));
        assert!(is_mcp_related_path("config/mcp.exm.json"));
        assert!(!is_mcp_related_path("package.json"));
    }

    #[test]
    fn paths_under_mcp_dir_match() {
        assert!(is_mcp_related_path("mcp/calculator/server.py"));
        assert!(is_mcp_related_path("./mcp/tools.toml"));
        assert!(is_mcp_related_path("workspace/mcp/x"));
        assert!(!is_mcp_related_path("mcpish/file.txt"));
    }

    #[test]
    fn bin_entries_with_mcp_in_name_match() {
        assert!(is_mcp_related_path("bin/my-mcp-server"));
        assert!(is_mcp_related_path("/usr/local/bin/fooMCP"));
        assert!(!is_mcp_related_path("bin/other-tool"));
    }

    #[test]
    fn inspector_walks_nested_args() {
        let args = serde_json::json!({
            "path": "mcp/calculator/server.py",
            "content": "x"
        });
        assert!(args_touch_mcp_paths(&args));

        let nested = serde_json::json!({
            "ops": [{"dest": "src/main.rs"}, {"dest": "mcp.json"}]
        });
        assert!(args_touch_mcp_paths(&nested));

        let clean = serde_json::json!({"path": "src/lib.rs", "count": 3});
        assert!(!args_touch_mcp_paths(&clean));
    }

    #[test]
    fn explicit_reload_tool_does_not_self_trigger() {
        let args = serde_json::json!({"path": "mcp.json"});
        assert!(!call_triggers_reload(MCP_RELOAD_TOOL, &args));
        assert!(call_triggers_reload("write_file", &args));
    }

    #[test]
    fn nl_phrases_recognized() {
        assert!(text_requests_reload("please reload MCP now"));
        assert!(text_requests_reload("帮我重新加载mcp服务"));
        assert!(!text_requests_reload("tell me about mcp servers"));
    }
}
