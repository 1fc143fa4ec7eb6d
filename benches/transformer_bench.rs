//! Benchmarks for protocol translation.
//!
//! Run with: cargo bench --bench transformer_bench
//!
//! Measures request translation for every client/backend pair, stream
//! translation throughput and tool-name map construction.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use llm_relay_rust::transformer::tool_names::TOOL_NAME_LIMIT;
use llm_relay_rust::transformer::{
    Protocol, ResponseContext, StreamState, ToolNameMap, TranslatorRegistry,
};
use serde_json::{json, Value};

fn sample_request(protocol: Protocol) -> Value {
    let tools = json!([{
        "type": "function",
        "function": {
            "name": "get_weather",
            "description": "Current weather",
            "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
        }
    }]);
    match protocol {
        Protocol::OpenAI => json!({
            "model": "m",
            "messages": [
                {"role": "system", "content": "You are a helpful assistant."},
                {"role": "user", "content": "Weather in Paris?"}
            ],
            "tools": tools,
            "temperature": 0.7,
            "max_tokens": 1000
        }),
        Protocol::OpenAIResponses | Protocol::Codex => json!({
            "model": "m",
            "instructions": "You are a helpful assistant.",
            "input": [{"role": "user", "content": "Weather in Paris?"}],
            "tools": [{"type": "function", "name": "get_weather", "parameters": {"type": "object"}}]
        }),
        Protocol::Claude => json!({
            "model": "m",
            "max_tokens": 1024,
            "system": "You are a helpful assistant.",
            "messages": [{"role": "user", "content": "Weather in Paris?"}],
            "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}]
        }),
        Protocol::Gemini => json!({
            "systemInstruction": {"parts": [{"text": "You are a helpful assistant."}]},
            "contents": [{"role": "user", "parts": [{"text": "Weather in Paris?"}]}],
            "tools": [{"functionDeclarations": [{"name": "get_weather", "parameters": {"type": "object"}}]}]
        }),
        Protocol::GeminiCli => json!({
            "model": "m",
            "project": "p",
            "request": {"contents": [{"role": "user", "parts": [{"text": "Weather in Paris?"}]}]}
        }),
    }
}

fn bench_request_translation(c: &mut Criterion) {
    let registry = TranslatorRegistry::with_defaults();
    let mut group = c.benchmark_group("request_translation");
    for client in Protocol::ALL {
        for backend in Protocol::ALL {
            let body = sample_request(client);
            let id = format!("{}->{}", client, backend);
            group.bench_with_input(BenchmarkId::from_parameter(id), &body, |b, body| {
                b.iter(|| {
                    registry.request(client, backend, "m", black_box(body.clone()), false)
                })
            });
        }
    }
    group.finish();
}

fn claude_events(deltas: usize) -> Vec<String> {
    let mut events = vec![
        json!({"type": "message_start", "message": {"id": "msg_1", "model": "m", "usage": {"input_tokens": 3}}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
    ];
    events.extend((0..deltas).map(|i| {
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": format!("token{} ", i)}})
    }));
    events.push(json!({"type": "content_block_stop", "index": 0}));
    events.push(json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": deltas}}));
    events.push(json!({"type": "message_stop"}));
    events.iter().map(Value::to_string).collect()
}

fn bench_stream_translation(c: &mut Criterion) {
    let registry = TranslatorRegistry::with_defaults();
    let events = claude_events(200);
    let bytes: usize = events.iter().map(String::len).sum();
    let ctx = ResponseContext::new("m", json!({}), json!({}));

    let mut group = c.benchmark_group("stream_translation");
    group.throughput(Throughput::Bytes(bytes as u64));
    for client in [Protocol::OpenAI, Protocol::OpenAIResponses, Protocol::Gemini, Protocol::Claude] {
        group.bench_function(BenchmarkId::from_parameter(client), |b| {
            b.iter(|| {
                let mut state = StreamState::new("m");
                let mut frames = 0;
                for event in &events {
                    frames += registry
                        .response_stream(client, Protocol::Claude, &ctx, event.as_bytes(), &mut state)
                        .map(|f| f.len())
                        .unwrap_or(0);
                }
                frames += registry
                    .finish_stream(client, Protocol::Claude, &ctx, &mut state)
                    .map(|f| f.len())
                    .unwrap_or(0);
                black_box(frames)
            })
        });
    }
    group.finish();
}

fn bench_tool_name_map(c: &mut Criterion) {
    let names: Vec<String> = (0..32)
        .map(|i| format!("mcp__server_{}__{}", i, "long_tool_name_segment_".repeat(4)))
        .collect();
    c.bench_function("tool_name_map_build_32", |b| {
        b.iter(|| ToolNameMap::build(black_box(names.iter().map(String::as_str)), TOOL_NAME_LIMIT))
    });
}

criterion_group!(
    benches,
    bench_request_translation,
    bench_stream_translation,
    bench_tool_name_map
);
criterion_main!(benches);
