//! 工具参数 JSON Schema 生成（schemars）
//!
//! 参数结构体 derive JsonSchema，生成的 schema 直接作为 ToolDefinition.parameters 发给模型。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 生成参数 schema，去掉模型不需要的 `$schema` / `title`
pub fn parameters_schema_for<T: JsonSchema>() -> Value {
    let schema = schema_for!(T);
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| {
        serde_json::json!({ "type": "object", "properties": {} })
    });
    if let Value::Object(map) = &mut value {
        map.remove("$schema");
        map.remove("title");
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(dead_code)]
    #[derive(JsonSchema)]
    struct Args {
        /// 要执行的命令
        command: String,
        depth: Option<u32>,
    }

    #[test]
    fn test_schema_lists_required_fields() {
        let schema = parameters_schema_for::<Args>();
        assert_eq!(schema["type"], "object");
        assert!(schema.get("$schema").is_none());
        assert!(schema["properties"]["command"].is_object());
        let required = schema["required"].as_array().cloned().unwrap_or_default();
        assert_eq!(required, vec![serde_json::json!("command")]);
    }
}
