use crate::manifest::{CandidateConfig, EventMapRule};
use crate::pipeline::{decode, event_map, fan_out, select, Decoder, Mapper, Transform};
use crate::types::events::StreamingEvent;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;

fn byte_stream(chunks: Vec<&'static str>) -> crate::BoxStream<'static, Bytes> {
    Box::pin(futures::stream::iter(
        chunks.into_iter().map(|s| Ok(Bytes::from(s))),
    ))
}

async fn collect_frames(
    stream: crate::BoxStream<'static, serde_json::Value>,
) -> Vec<serde_json::Value> {
    stream.map(|r| r.unwrap()).collect().await
}

async fn collect_events(
    stream: crate::BoxStream<'static, StreamingEvent>,
) -> Vec<StreamingEvent> {
    stream.map(|r| r.unwrap()).collect().await
}

#[tokio::test]
async fn sse_decoder_emits_frames_and_stops_on_done() {
    let decoder = decode::SseDecoder::openai_default();
    let input = byte_stream(vec![
        "data: {\"a\": 1}\n\n",
        ": a comment line\n\ndata: {\"b\": 2}\n\n",
        "data: [DONE]\n\ndata: {\"after\": true}\n\n",
    ]);
    let frames = collect_frames(decoder.decode_stream(input).await.unwrap()).await;
    assert_eq!(frames, vec![json!({"a": 1}), json!({"b": 2})]);
}

#[tokio::test]
async fn sse_decoder_is_chunking_invariant() {
    let payload = "data: {\"choices\":[{\"delta\":{\"content\":\"He\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"llo\"}}]}\n\ndata: [DONE]\n\n";

    // Whole stream at once
    let whole = {
        let decoder = decode::SseDecoder::openai_default();
        let input: crate::BoxStream<'static, Bytes> = Box::pin(futures::stream::iter(vec![Ok(
            Bytes::from(payload.to_string()),
        )]));
        collect_frames(decoder.decode_stream(input).await.unwrap()).await
    };

    // Byte-by-byte
    let trickled = {
        let decoder = decode::SseDecoder::openai_default();
        let chunks: Vec<Result<Bytes, crate::Error>> = payload
            .as_bytes()
            .iter()
            .map(|b| Ok(Bytes::copy_from_slice(&[*b])))
            .collect();
        let input: crate::BoxStream<'static, Bytes> =
            Box::pin(futures::stream::iter(chunks));
        collect_frames(decoder.decode_stream(input).await.unwrap()).await
    };

    // A few awkward split points
    let split = {
        let decoder = decode::SseDecoder::openai_default();
        let (a, rest) = payload.split_at(7);
        let (b, c) = rest.split_at(41);
        let chunks: Vec<Result<Bytes, crate::Error>> = vec![
            Ok(Bytes::from(a.to_string())),
            Ok(Bytes::from(b.to_string())),
            Ok(Bytes::from(c.to_string())),
        ];
        let input: crate::BoxStream<'static, Bytes> =
            Box::pin(futures::stream::iter(chunks));
        collect_frames(decoder.decode_stream(input).await.unwrap()).await
    };

    assert_eq!(whole.len(), 2);
    assert_eq!(whole, trickled);
    assert_eq!(whole, split);
}

#[tokio::test]
async fn sse_decoder_drops_malformed_frames() {
    let decoder = decode::SseDecoder::openai_default();
    let input = byte_stream(vec![
        "data: {\"ok\": 1}\n\n",
        "data: {not json at all\n\n",
        "data: {\"ok\": 2}\n\n",
    ]);
    let frames = collect_frames(decoder.decode_stream(input).await.unwrap()).await;
    assert_eq!(frames, vec![json!({"ok": 1}), json!({"ok": 2})]);
}

#[tokio::test]
async fn anthropic_decoder_preserves_event_annotation() {
    let cfg = crate::manifest::DecoderConfig {
        format: "anthropic_sse".into(),
        strategy: Some("anthropic_event_stream".into()),
        delimiter: None,
        prefix: None,
        done_signal: None,
    };
    let decoder = decode::create_decoder(&cfg).unwrap();
    let input = byte_stream(vec![
        "event: message_start\ndata: {\"message\":{\"id\":\"msg_1\"}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
    ]);
    let frames = collect_frames(decoder.decode_stream(input).await.unwrap()).await;
    assert_eq!(frames[0]["_event_type"], "message_start");
    // The frame's own type is authoritative when present
    assert_eq!(frames[1]["type"], "content_block_delta");
    assert_eq!(frames[1]["_event_type"], "content_block_delta");
}

#[tokio::test]
async fn ndjson_decoder_splits_lines() {
    let decoder = decode::JsonLinesDecoder;
    let input = byte_stream(vec!["{\"n\": 1}\n{\"n\"", ": 2}\nnot-json\n{\"n\": 3}"]);
    let frames = collect_frames(decoder.decode_stream(input).await.unwrap()).await;
    assert_eq!(frames, vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})]);
}

#[tokio::test]
async fn selector_keeps_matching_frames() {
    let selector = select::FrameSelector::new("exists($.choices) || exists($.error)").unwrap();
    let input: crate::BoxStream<'static, serde_json::Value> =
        Box::pin(futures::stream::iter(
            vec![
                json!({"choices": [{"delta": {}}]}),
                json!({"ping": true}),
                json!({"error": {"message": "boom"}}),
            ]
            .into_iter()
            .map(Ok),
        ));
    let out = collect_frames(selector.transform(input).await.unwrap()).await;
    assert_eq!(out.len(), 2);
    assert!(out[0].get("choices").is_some());
    assert!(out[1].get("error").is_some());
}

#[tokio::test]
async fn rule_mapper_first_match_wins() {
    let rules = vec![
        EventMapRule {
            match_expr: "exists($.choices[*].delta.content)".into(),
            emit: "ContentDelta".into(),
            fields: Some(
                [("content".to_string(), "$.choices[0].delta.content".to_string())]
                    .into_iter()
                    .collect(),
            ),
        },
        EventMapRule {
            match_expr: "exists($.usage)".into(),
            emit: "Metadata".into(),
            fields: Some(
                [("usage".to_string(), "$.usage".to_string())]
                    .into_iter()
                    .collect(),
            ),
        },
    ];
    let mapper = event_map::RuleBasedEventMapper::new(&rules).unwrap();

    // A frame carrying both content and usage emits only the first rule's event.
    let input: crate::BoxStream<'static, serde_json::Value> =
        Box::pin(futures::stream::iter(
            vec![
                json!({"choices": [{"delta": {"content": "Hi"}}], "usage": {"total": 3}}),
                json!({"usage": {"total": 5}}),
            ]
            .into_iter()
            .map(Ok),
        ));
    let events = collect_events(mapper.map(input).await.unwrap()).await;

    assert_eq!(
        events[0],
        StreamingEvent::ContentDelta {
            content: "Hi".into(),
            sequence_id: None
        }
    );
    assert!(matches!(events[1], StreamingEvent::Metadata { .. }));
    assert_eq!(events.last(), Some(&StreamingEvent::stream_end()));
}

#[tokio::test]
async fn rule_mapper_emits_stream_end_only_once() {
    let rules = vec![EventMapRule {
        match_expr: "$.done == 'true'".into(),
        emit: "StreamEnd".into(),
        fields: None,
    }];
    let mapper = event_map::RuleBasedEventMapper::new(&rules).unwrap();
    let input: crate::BoxStream<'static, serde_json::Value> = Box::pin(
        futures::stream::iter(vec![json!({"done": "true"}), json!({"done": "true"})]
            .into_iter()
            .map(Ok)),
    );
    let events = collect_events(mapper.map(input).await.unwrap()).await;
    let ends = events
        .iter()
        .filter(|e| matches!(e, StreamingEvent::StreamEnd { .. }))
        .count();
    assert_eq!(ends, 1);
}

#[tokio::test]
async fn fan_out_splits_array_frames() {
    let fan = fan_out::CandidateFanOut::new(&CandidateConfig {
        candidates_path: None,
        fan_out: Some(true),
    })
    .unwrap();
    let input: crate::BoxStream<'static, serde_json::Value> = Box::pin(
        futures::stream::iter(vec![json!(["A"]), json!(["B", "C"])].into_iter().map(Ok)),
    );
    let out = collect_frames(fan.transform(input).await.unwrap()).await;
    assert_eq!(out, vec![json!("A"), json!("B"), json!("C")]);
}

#[tokio::test]
async fn path_mapper_emits_stream_error_for_error_frames() {
    let mapper = event_map::PathEventMapper::new(None, None, None, None);
    let input: crate::BoxStream<'static, serde_json::Value> = Box::pin(
        futures::stream::iter(
            vec![json!({"error": {"message": "overloaded", "type": "overloaded_error"}})]
                .into_iter()
                .map(Ok),
        ),
    );
    let events = collect_events(mapper.map(input).await.unwrap()).await;
    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamingEvent::StreamError { error, .. } => {
            assert_eq!(error["message"], "overloaded");
        }
        other => panic!("expected StreamError, got {:?}", other),
    }
}
