//! Rendering call history as a provider conversation.
//!
//! History is append-only and may carry tool results that arrive long after
//! their call (background tools) or several results for one call (generator
//! tools). Providers expect every call answered exactly once, right after
//! the message that made it, so those cases are rewritten as fresh
//! call/result pairs with derived ids (`{id}#{n}`).

use super::events::{Event, TurnContent};
use super::llm::{Message, Role, ToolCallRequest};
use serde_json::Value;
use std::collections::HashMap;

/// Placeholder result for a call whose answer is not in history yet.
pub const PENDING_RESULT: &str = r#"{"status":"pending"}"#;

#[must_use]
pub fn build_messages(history: &[Event]) -> Vec<Message> {
    let mut builder = Builder::default();
    for event in history {
        builder.push(event);
    }
    builder.finish()
}

#[derive(Default)]
struct Builder {
    messages: Vec<Message>,
    /// Calls from the latest assistant message that still need an answer.
    open: Vec<String>,
    /// Results already seen per call id, for deriving repeat ids.
    answered: HashMap<String, usize>,
}

impl Builder {
    fn push(&mut self, event: &Event) {
        match event {
            Event::UserTurnEnded { content } => {
                let text = render_turn(content);
                if !text.is_empty() {
                    self.user(text);
                }
            }
            Event::UserTextSent { content } => self.user(content.clone()),
            Event::UserDtmfSent { button } => self.user(format!("[dtmf {button}]")),
            Event::AgentSendText { text } => self.assistant_text(text),
            Event::AgentToolCalled { id, name, args } => self.tool_call(ToolCallRequest {
                id: id.clone(),
                name: name.clone(),
                arguments: args.clone(),
            }),
            Event::AgentToolReturned { id, name, args, result } => self.tool_result(id, name, args, result),
            _ => {}
        }
    }

    fn user(&mut self, content: String) {
        self.close_open_calls();
        self.messages.push(Message::user(content));
    }

    fn assistant_text(&mut self, text: &str) {
        if self.open.is_empty() {
            if let Some(last) = self.messages.last_mut() {
                if last.role == Role::Assistant && last.tool_calls.is_empty() {
                    last.content.get_or_insert_with(String::new).push_str(text);
                    return;
                }
            }
        }
        self.close_open_calls();
        self.messages.push(Message::assistant(text));
    }

    fn tool_call(&mut self, call: ToolCallRequest) {
        // Calls of one round share an assistant message.
        let extends_last = !self.open.is_empty()
            || self.messages.last().is_some_and(|last| last.role == Role::Assistant);
        if !extends_last || self.last_has_results() {
            self.close_open_calls();
            self.messages.push(Message { role: Role::Assistant, ..Message::default() });
        }
        self.open.push(call.id.clone());
        if let Some(last) = self.messages.last_mut() {
            last.tool_calls.push(call);
        }
    }

    fn tool_result(&mut self, id: &str, name: &str, args: &Value, result: &Value) {
        let seen = self.answered.entry(id.to_string()).or_insert(0);
        *seen += 1;
        if let Some(pos) = self.open.iter().position(|open| open == id) {
            self.open.remove(pos);
            self.messages.push(Message::tool_result(id, render_result(result)));
            return;
        }
        // Late or repeated result: pair it with a synthesized call.
        let derived = format!("{id}#{seen}");
        self.close_open_calls();
        self.messages.push(Message {
            role: Role::Assistant,
            tool_calls: vec![ToolCallRequest {
                id: derived.clone(),
                name: name.to_string(),
                arguments: args.clone(),
            }],
            ..Message::default()
        });
        self.messages.push(Message::tool_result(derived, render_result(result)));
    }

    fn last_has_results(&self) -> bool {
        self.messages.last().is_some_and(|last| last.role == Role::Tool)
    }

    /// Answer still-open calls so the next message starts a clean exchange.
    fn close_open_calls(&mut self) {
        for id in std::mem::take(&mut self.open) {
            self.messages.push(Message::tool_result(id, PENDING_RESULT));
        }
    }

    fn finish(mut self) -> Vec<Message> {
        self.close_open_calls();
        self.messages
    }
}

fn render_turn(content: &[TurnContent]) -> String {
    content
        .iter()
        .map(|part| match part {
            TurnContent::Text { content } => content.clone(),
            TurnContent::Dtmf { button } => format!("[dtmf {button}]"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_result(result: &Value) -> String {
    match result {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn called(id: &str) -> Event {
        Event::AgentToolCalled { id: id.to_string(), name: "lookup".to_string(), args: json!({}) }
    }

    fn returned(id: &str, result: &str) -> Event {
        Event::AgentToolReturned {
            id: id.to_string(),
            name: "lookup".to_string(),
            args: json!({}),
            result: Value::from(result),
        }
    }

    #[test]
    fn consecutive_agent_text_is_merged() {
        let messages = build_messages(&[
            Event::CallStarted,
            Event::user_turn_ended("hello"),
            Event::AgentSendText { text: "Hi ".to_string() },
            Event::AgentSendText { text: "there".to_string() },
        ]);
        assert_eq!(messages, vec![Message::user("hello"), Message::assistant("Hi there")]);
    }

    #[test]
    fn tool_calls_pair_with_results() {
        let messages = build_messages(&[
            Event::user_turn_ended("balance?"),
            called("c1"),
            called("c2"),
            returned("c1", "$10"),
            returned("c2", "$20"),
            Event::AgentSendText { text: "You have $30".to_string() },
        ]);
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[1].tool_calls.len(), 2);
        assert_eq!(messages[2], Message::tool_result("c1", "$10"));
        assert_eq!(messages[3], Message::tool_result("c2", "$20"));
        assert_eq!(messages[4], Message::assistant("You have $30"));
    }

    #[test]
    fn repeated_yields_get_derived_ids() {
        let messages = build_messages(&[
            Event::user_turn_ended("check"),
            called("c1"),
            returned("c1", "Looking up"),
            returned("c1", "Balance: $10"),
        ]);
        assert_eq!(messages[2], Message::tool_result("c1", "Looking up"));
        assert_eq!(messages[3].tool_calls[0].id, "c1#2");
        assert_eq!(messages[4], Message::tool_result("c1#2", "Balance: $10"));
    }

    #[test]
    fn late_results_are_answered_as_pending_first() {
        let messages = build_messages(&[
            Event::user_turn_ended("check"),
            called("bg"),
            Event::user_turn_ended("still there?"),
            returned("bg", "done"),
        ]);
        assert_eq!(messages[2], Message::tool_result("bg", PENDING_RESULT));
        assert_eq!(messages[3], Message::user("still there?"));
        assert_eq!(messages[4].tool_calls[0].id, "bg#1");
        assert_eq!(messages[5], Message::tool_result("bg#1", "done"));
    }

    #[test]
    fn dtmf_is_rendered_as_user_input() {
        let messages = build_messages(&[
            Event::UserDtmfSent { button: "5".to_string() },
            Event::UserTurnEnded {
                content: vec![TurnContent::text("press"), TurnContent::Dtmf { button: "#".to_string() }],
            },
        ]);
        assert_eq!(messages, vec![Message::user("[dtmf 5]"), Message::user("press [dtmf #]")]);
    }
}
