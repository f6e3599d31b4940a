use crate::types::{McpResource, McpResourceTemplate, McpTool};

/// Instructions placed ahead of every server's tool catalogue.
pub const TOOLING_PREAMBLE: &str = r#"
You are calling tools based on the user input to gather more information to enrich a role-playing response and to perform relevant actions. Only reply with the appropriate tool calls and nothing else.
The tool name is in between angle brackets "<>". For example, a line with <tool-name> indicates a tool with name "tool-name". On this line you will also see a description of what the tool does, and it may be followed by a line containing an input schema or URI template describing the parameters the tool takes.
Input schemas are JSON objects. The parameters are the keys of object "properties", and the type of each is given under key "type" in its paired object. For example, input schema {"type": "object", "properties": {"name": {"type": "number"}, "description": {"type": "string"}}} has 2 parameters: name of type number and description of type string.
URI templates have their parameters in curly brackets "{}". For example internet://{name}&{description} has parameters "name" and "description". They can be any type.
Put each tool call on its own line, in the format: <name> {"param1": value1, "param2": value2}. The line starts with the tool name followed by a JSON object where each key is a parameter and each value its argument. Surround string values with "" and do not use " anywhere inside a value. If there are no parameters, give the name and an empty JSON object, for example: <name> {}
For tools with a URI template you may also write key="value" pairs. For example, to call <internet> with URI template internet://{name}&{description}, name Limit and description "Limit is an idiot", respond with: <internet> name="Limit" description="Limit is an idiot"
If you don't want to call any tools, simply reply with "<no-tool>"
Below is a list of descriptions for all available tools:

"#;

fn describe(description: &Option<String>) -> &str {
    description.as_deref().unwrap_or_default()
}

/// The catalogue a tool-selecting generator sees: every entry with its
/// description and its input schema or URI template.
pub fn tool_catalogue(
    tools: &[McpTool],
    resources: &[McpResource],
    templates: &[McpResourceTemplate],
) -> String {
    let mut prompt = String::new();
    for tool in tools {
        prompt.push_str(&format!(
            "<{name}> {}\nThis is the input schema for {name}: {}\n",
            describe(&tool.description),
            tool.input_schema,
            name = tool.name,
        ));
    }
    for resource in resources {
        prompt.push_str(&format!("<{}> {}\n", resource.name, describe(&resource.description)));
    }
    for template in templates {
        prompt.push_str(&format!(
            "<{}> {}\nThis is the URI template: {}\n",
            template.name,
            describe(&template.description),
            template.uri_template,
        ));
    }
    prompt
}

/// Names and descriptions only, so the responding generator knows what
/// each `[MCP#name]` line in its history means.
pub fn result_descriptions(
    tools: &[McpTool],
    resources: &[McpResource],
    templates: &[McpResourceTemplate],
) -> String {
    let mut prompt = String::new();
    for tool in tools {
        prompt.push_str(&format!("<{}> {}\n\n", tool.name, describe(&tool.description)));
    }
    for resource in resources {
        prompt.push_str(&format!("<{}> {}\n", resource.name, describe(&resource.description)));
    }
    for template in templates {
        prompt.push_str(&format!("<{}> {}\n\n", template.name, describe(&template.description)));
    }
    prompt
}
