//! System prompt describing the yaml tool-call protocol

const TOOL_PROTOCOL: &str = r#"You act by emitting tool calls inside ```yaml fences. A fence holds one
object or a list of objects; `tool` names the command and every other key
is a parameter. Tool calls run one at a time, in the order you write them,
and their results come back in the next user message.

```yaml
- tool: thinking
  content: Check how the config is loaded before editing it.
- tool: file
  cmd: read
  path: src/config.rs
```

Available tools:
- thinking / log / plan: private reasoning, a note for the user, or a plan summary (`content`)
- complete: finish the task (`result`)
- file: `cmd` read(path) | create(path, content) | list(path, recursive) | search(path, pattern) | edit(path, search, replace) | rename(from, to) | download(url, path)
- coder: `cmd` cmd(command, cwd) | node(code)
- browser: `action` open(url) | search(query) | state | analyze(question) | navigation(url|direction) | interact(selector, operation, value) | auth(site) | download(url, path)
- advance: `cmd` memory(action add(content, tags) | search(query, limit)) | compress(ids, summary) | parallel(tasks)
- mcp: `cmd` list | list_tool(server) | call_tool(server, tool, arguments)
- plan: `cmd` create(steps) | update(step, status) | show
- ask: ask the user a question (question, options)
- approval: ask the user a yes/no question (question)
- external: forward a request to the host application

Every message starts with <meta>historyId:N</meta>. Inside a `content`
parameter, <var historyId=N/> is replaced with the text of message N.
Use advance.compress to replace old messages with a summary when the
conversation grows long."#;

const CHILD_NOTE: &str = "You are a sub-agent working on one part of a larger task. When you are \
done, report your findings with `tool: complete_parallel_node` and `content: <report>`.";

/// Build the system prompt for an agent
pub fn system_prompt(is_child: bool, extra: Option<&str>) -> String {
    let mut prompt = String::from(
        "You are Weft, an autonomous coding agent working in the user's project directory.\n\n",
    );
    prompt.push_str(TOOL_PROTOCOL);
    if is_child {
        prompt.push_str("\n\n");
        prompt.push_str(CHILD_NOTE);
    }
    if let Some(extra) = extra.map(str::trim).filter(|extra| !extra.is_empty()) {
        prompt.push_str("\n\n");
        prompt.push_str(extra);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_prompt_mentions_reporting() {
        assert!(system_prompt(true, None).contains("complete_parallel_node"));
        assert!(!system_prompt(false, None).contains("sub-agent"));
        assert!(system_prompt(false, Some("Prefer small diffs.")).ends_with("Prefer small diffs."));
    }
}
