mod common;

use common::{EchoAgent, Harness, ScriptedProvider, Step, WAIT, call, text, tool_results, user_said};
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use voice_rt_rs::sdk::{DEFAULT_FALLBACK_MESSAGE, HistorySnapshot, ParamSchema};
use voice_rt_rs::{
    EngineConfig, EngineOutput, EngineState, Error, Event, EventFilter, EventKind, FnAgent, LlmAgent,
    OutputEvent, Tool, ToolOutput, ToolRegistry, agent_as_handoff,
};

fn is_tool_called(output: &EngineOutput, call_id: &str) -> bool {
    matches!(output, EngineOutput::Event(OutputEvent::AgentToolCalled { id, .. }) if id == call_id)
}

fn is_tool_returned(output: &EngineOutput, call_id: &str) -> bool {
    matches!(output, EngineOutput::Event(OutputEvent::AgentToolReturned { id, .. }) if id == call_id)
}

/// Background tool that returns `result` once `gate` is notified.
fn gated_tool(name: &str, gate: Arc<Notify>, result: &'static str) -> Tool {
    Tool::loopback(name, "Slow lookup", ParamSchema::new(), move |_ctx, _args| {
        let gate = Arc::clone(&gate);
        async move {
            gate.notified().await;
            ToolOutput::value(result)
        }
    })
    .background()
    .unwrap()
}

#[tokio::test]
async fn each_unit_sees_a_prefix_of_the_final_history() {
    let seen: Arc<Mutex<Vec<HistorySnapshot>>> = Arc::default();
    let recorded = Arc::clone(&seen);
    let agent = FnAgent::new("recorder", move |turn, cx| {
        let recorded = Arc::clone(&recorded);
        async move {
            let n = {
                let mut recorded = recorded.lock().unwrap();
                recorded.push(turn.history.clone());
                recorded.len()
            };
            cx.send_text(format!("reply {n}")).await
        }
    });
    let mut engine = Harness::start(Arc::new(agent));

    for turn in ["one", "two", "three"] {
        engine.send(user_said(turn)).await;
        engine.next_text().await;
    }
    let last = engine.handle.history().snapshot().await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    for pair in seen.windows(2) {
        assert!(pair[0].is_prefix_of(&pair[1]));
        assert!(pair[1].len() > pair[0].len());
    }
    assert!(seen[2].is_prefix_of(&last));
    for (snapshot, turn) in seen.iter().zip(["one", "two", "three"]) {
        assert_eq!(snapshot.events().last(), Some(&user_said(turn)));
    }
}

#[tokio::test]
async fn barge_in_cancels_pending_tool_and_clears_audio() {
    let started = Arc::new(Notify::new());
    let in_tool = Arc::clone(&started);
    let mut tools = ToolRegistry::new();
    tools
        .register(Tool::loopback("lookup", "Look up an order", ParamSchema::new(), move |_ctx, _args| {
            let in_tool = Arc::clone(&in_tool);
            async move {
                in_tool.notify_one();
                futures::future::pending::<voice_rt_rs::Result<ToolOutput>>().await
            }
        }))
        .unwrap();
    let provider = ScriptedProvider::new([
        Step::Reply(vec![call("c1", "lookup", json!({}))]),
        Step::Reply(vec![text("What else can I do?")]),
    ]);
    let agent = LlmAgent::builder().name("ada").provider(provider.clone()).tools(tools).build().unwrap();
    let mut engine = Harness::start(Arc::new(agent));

    engine.send(user_said("where is my order")).await;
    tokio::time::timeout(WAIT, started.notified()).await.unwrap();

    engine.send(Event::UserTurnStarted).await;
    let (_, before_clear) = engine.until(|output| matches!(output, EngineOutput::Clear)).await;
    assert!(before_clear.iter().any(|output| is_tool_called(output, "c1")));
    assert!(!before_clear.iter().any(|output| is_tool_returned(output, "c1")));
    tokio::time::timeout(WAIT, engine.handle.wait_for(EngineState::Idle)).await.unwrap().unwrap();

    engine.send(user_said("never mind")).await;
    let (output, superseded) = engine
        .until(|output| matches!(output, EngineOutput::Event(OutputEvent::AgentSendText { .. })))
        .await;
    assert_eq!(output, EngineOutput::Event(OutputEvent::text("What else can I do?")));
    assert!(!superseded.iter().any(|output| is_tool_returned(output, "c1")));

    let events = engine.events().await;
    assert!(tool_results(&events).is_empty());
    let called = events.iter().position(|e| matches!(e, Event::AgentToolCalled { .. })).unwrap();
    let barge = events.iter().position(|e| *e == Event::UserTurnStarted).unwrap();
    assert!(called < barge);
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn concurrent_input_runs_one_unit_at_a_time() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let agent = {
        let (active, peak, done) = (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&done));
        FnAgent::new("serial", move |_turn, cx| {
            let (active, peak, done) = (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&done));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                cx.run(tokio::time::sleep(Duration::from_millis(20))).await?;
                active.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Error>(())
            }
        })
        .with_cancel_filter(EventFilter::never())
    };
    let engine = Harness::start(Arc::new(agent));

    let sends = (0..5).map(|i| {
        let handle = engine.handle.clone();
        async move { handle.send(user_said(&format!("turn {i}"))).await }
    });
    for result in futures::future::join_all(sends).await {
        result.unwrap();
    }

    tokio::time::timeout(WAIT, async {
        while done.load(Ordering::SeqCst) < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let turns = engine.events().await.iter().filter(|e| e.kind() == EventKind::UserTurnEnded).count();
    assert_eq!(turns, 5);
}

#[tokio::test]
async fn background_tool_survives_interruption() {
    let gate = Arc::new(Notify::new());
    let mut tools = ToolRegistry::new();
    tools.register(gated_tool("fetch", Arc::clone(&gate), "3 results")).unwrap();
    let provider = ScriptedProvider::new([
        Step::Reply(vec![call("b1", "fetch", json!({}))]),
        Step::Hang,
        Step::Reply(vec![text("Found 3 results.")]),
    ]);
    let agent = LlmAgent::builder().provider(provider.clone()).tools(tools).build().unwrap();
    let mut engine = Harness::start(Arc::new(agent));

    engine.send(user_said("search for flights")).await;
    engine.until(|output| is_tool_called(output, "b1")).await;

    engine.send(user_said("are you there?")).await;
    provider.wait_for_calls(2).await;
    engine.send(Event::UserTurnStarted).await;
    engine.until(|output| matches!(output, EngineOutput::Clear)).await;

    gate.notify_one();
    assert_eq!(engine.next_text().await, "Found 3 results.");
    assert_eq!(tool_results(&engine.events().await), vec![("b1".to_string(), json!("3 results"))]);
}

#[tokio::test]
async fn handoff_moves_ownership_before_next_event() {
    let billing = EchoAgent::new("billing");
    let mut tools = ToolRegistry::new();
    tools
        .register(agent_as_handoff(billing.clone(), "transfer_to_billing", "Hand the caller to billing"))
        .unwrap();
    let provider = ScriptedProvider::new([Step::Reply(vec![call("h1", "transfer_to_billing", json!({}))])]);
    let front = LlmAgent::builder().name("front").provider(provider.clone()).tools(tools).build().unwrap();
    let mut engine = Harness::start(Arc::new(front));

    engine.send(user_said("I have a billing question")).await;
    assert_eq!(engine.next_text().await, "billing here");

    engine.send(user_said("my bill is wrong")).await;
    assert_eq!(engine.next_text().await, "billing: my bill is wrong");
    assert_eq!(provider.calls(), 1);

    let events = engine.events().await;
    let returned = events
        .iter()
        .position(|e| matches!(e, Event::AgentToolReturned { id, .. } if id == "h1"))
        .unwrap();
    let handed_off = events.iter().position(|e| *e == Event::AgentHandedOff).unwrap();
    let greeting = events
        .iter()
        .position(|e| *e == Event::AgentSendText { text: "billing here".to_string() })
        .unwrap();
    assert!(returned < handed_off && handed_off < greeting);

    engine.end().await;
    assert_eq!(
        billing.handled(),
        vec![EventKind::AgentHandedOff, EventKind::UserTurnEnded, EventKind::CallEnded]
    );
    assert_eq!(billing.cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn introduction_is_spoken_once() {
    let provider = ScriptedProvider::new([Step::Reply(vec![text("Sure.")])]);
    let agent = LlmAgent::builder()
        .name("ada")
        .introduction("Hi, this is Ada.")
        .provider(provider.clone())
        .build()
        .unwrap();
    let mut engine = Harness::start(Arc::new(agent));

    engine.send(Event::CallStarted).await;
    assert_eq!(engine.next_text().await, "Hi, this is Ada.");
    engine.send(user_said("can you help me")).await;
    assert_eq!(engine.next_text().await, "Sure.");

    let intros = engine
        .events()
        .await
        .iter()
        .filter(|e| **e == Event::AgentSendText { text: "Hi, this is Ada.".to_string() })
        .count();
    assert_eq!(intros, 1);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn tool_loop_stops_at_the_bound() {
    let mut tools = ToolRegistry::new();
    tools
        .register(Tool::loopback("noop", "Does nothing", ParamSchema::new(), |_ctx, _args| async {
            ToolOutput::value("ok")
        }))
        .unwrap();
    let provider = ScriptedProvider::with_fallback([], Step::Reply(vec![call("loop", "noop", json!({}))]));
    let agent = LlmAgent::builder()
        .provider(provider.clone())
        .tools(tools)
        .max_tool_iterations(3)
        .build()
        .unwrap();
    let mut engine = Harness::start(Arc::new(agent));

    engine.send(user_said("go")).await;
    let (failure, _) = engine
        .until(|output| matches!(output, EngineOutput::Event(OutputEvent::LogMessage { .. })))
        .await;
    let EngineOutput::Event(OutputEvent::LogMessage { name, metadata, .. }) = failure else {
        unreachable!();
    };
    assert_eq!(name, "turn_failed");
    assert_eq!(metadata["reason"], "tool_loop_exceeded");
    assert_eq!(engine.next_text().await, DEFAULT_FALLBACK_MESSAGE);

    let executed = engine.events().await.iter().filter(|e| e.kind() == EventKind::AgentToolCalled).count();
    assert_eq!(executed, 3);
    assert_eq!(provider.calls(), 4);
}

#[tokio::test]
async fn background_yields_follow_completion_order() {
    let slow_gate = Arc::new(Notify::new());
    let fast_gate = Arc::new(Notify::new());
    let mut tools = ToolRegistry::new();
    tools.register(gated_tool("slow", Arc::clone(&slow_gate), "slow done")).unwrap();
    tools.register(gated_tool("fast", Arc::clone(&fast_gate), "fast done")).unwrap();
    let provider = ScriptedProvider::new([Step::Reply(vec![
        call("s", "slow", json!({})),
        call("f", "fast", json!({})),
    ])]);
    let agent = LlmAgent::builder().provider(provider.clone()).tools(tools).build().unwrap();
    let mut engine = Harness::start(Arc::new(agent));

    engine.send(user_said("check both")).await;
    engine.until(|output| is_tool_called(output, "f")).await;

    fast_gate.notify_one();
    engine.until(|output| is_tool_returned(output, "f")).await;
    slow_gate.notify_one();
    engine.until(|output| is_tool_returned(output, "s")).await;

    let results = tool_results(&engine.events().await);
    assert_eq!(
        results,
        vec![("f".to_string(), json!("fast done")), ("s".to_string(), json!("slow done"))]
    );
    // Each yield triggers its own reasoning unit.
    provider.wait_for_calls(3).await;
}

#[tokio::test]
async fn background_yields_interleave_with_user_turns_in_arrival_order() {
    let gate = Arc::new(Notify::new());
    let release = Arc::clone(&gate);
    let balance = Tool::loopback("balance", "Account balance", ParamSchema::new(), move |_ctx, _args| {
        let gate = Arc::clone(&release);
        async move {
            let lookup = futures::stream::iter([Ok(json!("Looking up..."))]);
            let result = futures::stream::once(async move {
                gate.notified().await;
                Ok(json!("Balance: $10"))
            });
            Ok(ToolOutput::yields(lookup.chain(result)))
        }
    })
    .background()
    .unwrap();
    let mut tools = ToolRegistry::new();
    tools.register(balance).unwrap();
    let provider = ScriptedProvider::new([Step::Reply(vec![call("b1", "balance", json!({}))])]);
    let agent = LlmAgent::builder().provider(provider).tools(tools).build().unwrap();
    let mut engine = Harness::start(Arc::new(agent));

    engine.send(user_said("balance?")).await;
    engine.until(|output| is_tool_returned(output, "b1")).await;

    engine.send(Event::UserTurnStarted).await;
    engine.send(user_said("thanks")).await;
    let thanks = user_said("thanks");
    tokio::time::timeout(WAIT, async {
        while !engine.events().await.contains(&thanks) {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    gate.notify_one();
    engine.until(|output| is_tool_returned(output, "b1")).await;

    let returned = |result: &str| Event::AgentToolReturned {
        id: "b1".to_string(),
        name: "balance".to_string(),
        args: json!({}),
        result: json!(result),
    };
    let relevant: Vec<Event> = engine
        .events()
        .await
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                Event::UserTurnStarted
                    | Event::UserTurnEnded { .. }
                    | Event::AgentToolCalled { .. }
                    | Event::AgentToolReturned { .. }
            )
        })
        .collect();
    assert_eq!(
        relevant,
        vec![
            user_said("balance?"),
            Event::AgentToolCalled { id: "b1".to_string(), name: "balance".to_string(), args: json!({}) },
            returned("Looking up..."),
            Event::UserTurnStarted,
            user_said("thanks"),
            returned("Balance: $10"),
        ]
    );
}

#[tokio::test]
async fn failed_turn_falls_back_and_call_continues() {
    let provider = ScriptedProvider::new([
        Step::Fail(voice_rt_rs::ProviderErrorKind::Authentication),
        Step::Reply(vec![text("I'm back.")]),
    ]);
    let agent = LlmAgent::builder().provider(provider.clone()).build().unwrap();
    let mut engine = Harness::start(Arc::new(agent));

    engine.send(user_said("hello?")).await;
    let (failure, _) = engine
        .until(|output| matches!(output, EngineOutput::Event(OutputEvent::LogMessage { .. })))
        .await;
    let EngineOutput::Event(OutputEvent::LogMessage { metadata, .. }) = failure else {
        unreachable!();
    };
    assert_eq!(metadata["reason"], "provider_exhausted");
    assert_eq!(engine.next_text().await, DEFAULT_FALLBACK_MESSAGE);

    engine.send(user_said("hello again")).await;
    assert_eq!(engine.next_text().await, "I'm back.");
    assert_ne!(engine.handle.state(), EngineState::Ended);
}

#[tokio::test]
async fn failed_turn_can_end_the_call() {
    let provider = ScriptedProvider::new([Step::Fail(voice_rt_rs::ProviderErrorKind::Authentication)]);
    let agent = LlmAgent::builder().provider(provider).build().unwrap();
    let config = EngineConfig::default().fallback_message(None).end_call_on_failure(true);
    let mut engine = Harness::with_config(Arc::new(agent), config);

    engine.send(user_said("hello?")).await;
    let (_, before) = engine
        .until(|output| matches!(output, EngineOutput::Event(OutputEvent::AgentEndCall)))
        .await;
    assert!(!before.iter().any(|o| matches!(o, EngineOutput::Event(OutputEvent::AgentSendText { .. }))));
}

#[tokio::test]
async fn output_events_are_not_accepted_as_input() {
    let engine = Harness::start(EchoAgent::new("echo"));
    let err = engine.handle.send(Event::AgentEndCall).await.unwrap_err();
    assert!(matches!(err, Error::UnexpectedEvent(EventKind::AgentEndCall)));
}

#[tokio::test]
async fn ending_the_call_cleans_up_and_reports_ended() {
    let agent = EchoAgent::new("echo");
    let mut engine = Harness::start(agent.clone());
    engine.send(user_said("hi")).await;
    assert_eq!(engine.next_text().await, "echo: hi");

    engine.end().await;
    assert_eq!(engine.handle.state(), EngineState::Ended);
    assert_eq!(agent.cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(engine.events().await.last(), Some(&Event::CallEnded));
}
