//! End-to-end tests for the turn pipeline
//!
//! All tests run against the scripted transport, so no model is needed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stagehand::integration::{
    ChannelAudioSink, ImageGenerator, PipelineConfig, PipelineCoordinator, PipelineEvent,
    PipelineHandle, ScenePlanner, Stagehand, StagehandConfig, TriggerSource,
};
use stagehand::llm::{CompletionTransport, Script, ScriptedTransport};
use stagehand::scene::DocumentStore;
use stagehand::tools::ToolDispatcher;
use tokio::sync::broadcast;
use tokio::time::timeout;

const EMPTY_SCENE: &str = "<scene></scene>";
const RED_CUBE: &str = r#"<scene><cube color="red"/></scene>"#;

fn rewrite(xml: &str) -> Script {
    let arguments = serde_json::json!({ "xml": xml }).to_string();
    Script::new().tool_call(0, "rewrite_xml", &arguments)
}

/// Let the active turn open its completion stream
async fn let_turn_start() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn scene_pipeline(store: &DocumentStore, transport: Arc<ScriptedTransport>) -> PipelineHandle {
    PipelineCoordinator::spawn(
        ScenePlanner::new(ToolDispatcher::new("scene")),
        transport as Arc<dyn CompletionTransport>,
        store.clone(),
        &PipelineConfig::default(),
    )
}

/// Wait for the settlement of `generation`, skipping superseded turns
async fn settled(events: &mut broadcast::Receiver<PipelineEvent>, generation: u64) -> PipelineEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if event.is_settlement()
                && event.generation() == Some(generation)
                && !matches!(event, PipelineEvent::TurnSuperseded { .. })
            {
                return event;
            }
        }
    })
    .await
    .expect("turn did not settle in time")
}

/// Image generator counting its invocations
#[derive(Default)]
struct CountingGenerator {
    calls: AtomicUsize,
}

#[async_trait]
impl ImageGenerator for CountingGenerator {
    async fn generate(&self, prompt: &str) -> stagehand::Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("https://images.test/{}?p={}", n, prompt.len()))
    }
}

#[tokio::test]
async fn test_add_red_cube_end_to_end() {
    let transport = Arc::new(ScriptedTransport::with_scripts([
        rewrite(RED_CUBE),
        Script::new().content("A single red cube."),
    ]));
    let generator = Arc::new(CountingGenerator::default());

    let handle = Stagehand::builder(transport.clone())
        .with_image_generator(generator.clone())
        .build()
        .unwrap()
        .start();

    // The initial empty scene maps to the placeholder without a model call
    let mut images = handle.observe_images();
    let first = timeout(Duration::from_secs(5), async {
        loop {
            images.changed().await.unwrap();
            if let Some(image) = images.borrow_and_update().clone() {
                return image;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(first.prompt, "Empty scene");
    assert_eq!(handle.images().derivation_count(), 1);

    let mut events = handle.scene_events();
    assert!(handle.submit_text("add a red cube").unwrap());

    match settled(&mut events, 1).await {
        PipelineEvent::TurnCommitted { message, revision, .. } => {
            assert_eq!(message, "Done");
            assert_eq!(revision, 1);
        }
        other => panic!("unexpected settlement: {:?}", other),
    }
    assert_eq!(handle.scene().content, RED_CUBE);
    assert!(handle.scene_status().queued.is_empty());

    let image = timeout(Duration::from_secs(5), async {
        loop {
            images.changed().await.unwrap();
            if let Some(image) = images.borrow_and_update().clone() {
                if image.revision == 1 {
                    return image;
                }
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(image.prompt, "A single red cube.");
    assert_eq!(handle.images().derivation_count(), 2);
    assert_eq!(generator.calls.load(Ordering::SeqCst), 1);

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].last_user_message(), Some("add a red cube"));
    assert!(requests[0].messages[0].content.contains(EMPTY_SCENE));
    assert_eq!(requests[1].last_user_message(), Some(RED_CUBE));

    handle.shutdown().await;
}

/// The first turn is still waiting on its response when the second commits
#[tokio::test]
async fn test_late_first_turn_never_overwrites_second() {
    let store = DocumentStore::new(EMPTY_SCENE);
    let transport = Arc::new(ScriptedTransport::with_scripts([
        Script::new()
            .delay(Duration::from_millis(200))
            .tool_call(0, "rewrite_xml", r#"{"xml":"<scene><first/></scene>"}"#),
        rewrite("<scene><second/></scene>"),
    ]));
    let pipeline = scene_pipeline(&store, transport.clone());
    let mut events = pipeline.subscribe();

    pipeline.submit("first", TriggerSource::Text).unwrap();
    let_turn_start().await;
    pipeline.submit("second", TriggerSource::Voice).unwrap();

    assert!(matches!(
        settled(&mut events, 2).await,
        PipelineEvent::TurnCommitted { .. }
    ));
    assert_eq!(store.content(), "<scene><second/></scene>");

    // Outlast the first turn's scripted response
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.content(), "<scene><second/></scene>");
    assert_eq!(store.revision(), 1);

    let requests = transport.requests();
    assert_eq!(requests[1].last_user_message(), Some("first; second"));
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_failed_turn_keeps_queue() {
    let store = DocumentStore::new(EMPTY_SCENE);
    let transport = Arc::new(ScriptedTransport::with_scripts([
        Script::new().delay(Duration::from_secs(30)),
        Script::new().content("partial").fail("connection reset"),
    ]));
    let pipeline = scene_pipeline(&store, transport);
    let mut events = pipeline.subscribe();

    pipeline.submit("a", TriggerSource::Text).unwrap();
    let_turn_start().await;
    pipeline.submit("b", TriggerSource::Text).unwrap();

    assert!(matches!(
        settled(&mut events, 2).await,
        PipelineEvent::TurnFailed { .. }
    ));
    let status = pipeline.status();
    assert_eq!(status.queued, vec!["a".to_string(), "b".to_string()]);
    assert!(status.last_error.is_some());
    assert_eq!(store.revision(), 0);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_successful_turn_clears_queue() {
    let store = DocumentStore::new(EMPTY_SCENE);
    let transport = Arc::new(ScriptedTransport::with_scripts([
        Script::new().delay(Duration::from_secs(30)),
        rewrite(RED_CUBE),
    ]));
    let pipeline = scene_pipeline(&store, transport);
    let mut events = pipeline.subscribe();

    pipeline.submit("a", TriggerSource::Text).unwrap();
    let_turn_start().await;
    pipeline.submit("b", TriggerSource::Text).unwrap();

    assert!(matches!(
        settled(&mut events, 2).await,
        PipelineEvent::TurnCommitted { .. }
    ));
    assert!(pipeline.status().queued.is_empty());
    assert_eq!(store.content(), RED_CUBE);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_failed_backlog_retried_by_next_trigger() {
    let store = DocumentStore::new(EMPTY_SCENE);
    let transport = Arc::new(ScriptedTransport::with_scripts([
        Script::new().fail("timeout"),
        rewrite(RED_CUBE),
    ]));
    let pipeline = scene_pipeline(&store, transport.clone());
    let mut events = pipeline.subscribe();

    pipeline.submit("add a cube", TriggerSource::Text).unwrap();
    settled(&mut events, 1).await;

    pipeline.submit("make it red", TriggerSource::Text).unwrap();
    settled(&mut events, 2).await;

    assert_eq!(
        transport.requests()[1].last_user_message(),
        Some("add a cube; make it red")
    );
    assert!(pipeline.status().queued.is_empty());
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_full_replace_twice_is_idempotent() {
    let store = DocumentStore::new(EMPTY_SCENE);
    let transport = Arc::new(ScriptedTransport::with_scripts([
        rewrite(RED_CUBE),
        rewrite(RED_CUBE),
    ]));
    let pipeline = scene_pipeline(&store, transport);
    let mut events = pipeline.subscribe();

    pipeline.submit("add a red cube", TriggerSource::Text).unwrap();
    settled(&mut events, 1).await;
    let after_first = store.content();

    pipeline.submit("add a red cube", TriggerSource::Text).unwrap();
    settled(&mut events, 2).await;

    assert_eq!(after_first, RED_CUBE);
    assert_eq!(store.content(), after_first);
    assert_eq!(store.revision(), 2);
    pipeline.shutdown().await;
}

/// The second operation targets a missing element, so the first must not stick
#[tokio::test]
async fn test_failed_patch_leaves_document_untouched() {
    let original = r#"<scene><room style="cozy"><cube/></room></scene>"#;
    let store = DocumentStore::new(original);
    let patch = serde_json::json!({
        "operations": [
            { "op": "set_attribute", "target": "scene/room/cube", "name": "color", "value": "red" },
            { "op": "remove", "target": "scene/room/sphere" }
        ]
    })
    .to_string();
    let transport = Arc::new(ScriptedTransport::with_scripts([
        Script::new().tool_call(0, "patch_scene", &patch),
    ]));
    let pipeline = scene_pipeline(&store, transport);
    let mut events = pipeline.subscribe();

    pipeline.submit("paint the cube, drop the sphere", TriggerSource::Text).unwrap();

    match settled(&mut events, 1).await {
        PipelineEvent::TurnCompleted { message, .. } => {
            assert!(message.starts_with("Error:"), "{}", message);
            assert!(message.contains("operation 1"));
        }
        other => panic!("unexpected settlement: {:?}", other),
    }
    assert_eq!(store.content(), original);
    assert_eq!(store.revision(), 0);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_successful_patch_commits() {
    let store = DocumentStore::new(EMPTY_SCENE);
    let patch = serde_json::json!({
        "operations": [
            { "op": "append", "target": "scene", "xml": "<cube/>" },
            { "op": "set_attribute", "target": "scene/cube", "name": "color", "value": "red" }
        ]
    })
    .to_string();
    let transport = Arc::new(ScriptedTransport::with_scripts([
        Script::new().tool_call(0, "patch_scene", &patch),
    ]));
    let pipeline = scene_pipeline(&store, transport);
    let mut events = pipeline.subscribe();

    pipeline.submit("add a red cube", TriggerSource::Text).unwrap();
    assert!(matches!(
        settled(&mut events, 1).await,
        PipelineEvent::TurnCommitted { .. }
    ));
    assert_eq!(store.content(), RED_CUBE);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_stop_cancels_and_keeps_queue() {
    let store = DocumentStore::new(EMPTY_SCENE);
    let transport = Arc::new(ScriptedTransport::with_scripts([Script::new()
        .delay(Duration::from_secs(30))
        .tool_call(0, "rewrite_xml", r#"{"xml":"<scene><late/></scene>"}"#)]));
    let pipeline = scene_pipeline(&store, transport);
    let mut events = pipeline.subscribe();

    pipeline.submit("add something", TriggerSource::Text).unwrap();
    let_turn_start().await;
    pipeline.cancel().unwrap();

    assert!(matches!(
        settled(&mut events, 1).await,
        PipelineEvent::TurnCancelled { .. }
    ));
    let status = pipeline.status();
    assert_eq!(status.queued, vec!["add something".to_string()]);
    assert!(!status.active);
    assert_eq!(store.revision(), 0);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_stop_right_after_submit_never_commits() {
    let store = DocumentStore::new(EMPTY_SCENE);
    let transport = Arc::new(ScriptedTransport::with_scripts([rewrite(RED_CUBE)]));
    let pipeline = scene_pipeline(&store, transport);
    let mut events = pipeline.subscribe();

    // Both messages are queued before the slot loop runs
    pipeline.submit("add a red cube", TriggerSource::Text).unwrap();
    pipeline.cancel().unwrap();

    assert!(matches!(
        settled(&mut events, 1).await,
        PipelineEvent::TurnCancelled { .. }
    ));

    // Give a late result time to arrive; it must not land
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.content(), EMPTY_SCENE);
    assert_eq!(store.revision(), 0);
    let status = pipeline.status();
    assert_eq!(status.queued, vec!["add a red cube".to_string()]);
    assert!(!status.active);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_superseded_turn_settles_once_without_commit() {
    let store = DocumentStore::new(EMPTY_SCENE);
    let transport = Arc::new(ScriptedTransport::with_scripts([
        Script::new()
            .delay(Duration::from_millis(100))
            .tool_call(0, "rewrite_xml", r#"{"xml":"<scene><first/></scene>"}"#),
        rewrite("<scene><second/></scene>"),
    ]));
    let pipeline = scene_pipeline(&store, transport);
    let mut events = pipeline.subscribe();

    pipeline.submit("first", TriggerSource::Text).unwrap();
    let_turn_start().await;
    pipeline.submit("second", TriggerSource::Text).unwrap();

    // The first turn settles as superseded, never as a commit of its own
    let mut first_settlements = Vec::new();
    let second = timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.generation() == Some(1) && event.is_settlement() {
                first_settlements.push(event.clone());
            }
            if event.generation() == Some(2) && event.is_settlement() {
                return event;
            }
        }
    })
    .await
    .unwrap();

    assert!(matches!(second, PipelineEvent::TurnCommitted { .. }));
    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Ok(event) = events.try_recv() {
        if event.generation() == Some(1) {
            first_settlements.push(event);
        }
    }
    assert_eq!(first_settlements.len(), 1);
    assert!(matches!(first_settlements[0], PipelineEvent::TurnSuperseded { .. }));
    assert_eq!(store.content(), "<scene><second/></scene>");
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_forwarded_sources_drop_empty_text() {
    let store = DocumentStore::new(EMPTY_SCENE);
    let transport = Arc::new(ScriptedTransport::with_scripts([rewrite(RED_CUBE)]));
    let pipeline = scene_pipeline(&store, transport.clone());
    let mut events = pipeline.subscribe();

    let voice = pipeline.trigger_sender(TriggerSource::Voice);
    let forwarder = voice.forward_from(futures::stream::iter(vec![
        String::new(),
        "  ".to_string(),
        "add a red cube".to_string(),
    ]));
    forwarder.await.unwrap();

    settled(&mut events, 1).await;
    assert_eq!(transport.request_count(), 1);
    assert_eq!(store.content(), RED_CUBE);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_dialogue_streams_utterances_to_audio() {
    let dialogue = r#"{"utterances":[{"speaker":"novice","utterance":"What is on the stage?"},{"speaker":"expert","utterance":"A red cube."}]}"#;
    let transport = Arc::new(ScriptedTransport::with_scripts([
        Script::new().content_chunks(dialogue, 7),
    ]));
    let (audio, spoken) = ChannelAudioSink::bounded(8);

    let handle = Stagehand::builder(transport.clone())
        .with_config(StagehandConfig::default().without_images())
        .with_audio_sink(Arc::new(audio))
        .build()
        .unwrap()
        .start();
    let mut events = handle.dialogue_events();

    assert!(handle.simulate("").unwrap());
    assert!(matches!(
        settled(&mut events, 1).await,
        PipelineEvent::TurnCommitted { .. }
    ));

    assert_eq!(spoken.try_recv().unwrap(), "What is on the stage?");
    assert_eq!(spoken.try_recv().unwrap(), "A red cube.");
    assert_eq!(
        handle.transcript().content,
        "novice: What is on the stage?\nexpert: A red cube."
    );

    let request = &transport.requests()[0];
    assert_eq!(request.max_tokens, Some(4000));
    assert!(request.messages[0].content.contains("related to the world model"));
    assert!(request.messages[1].content.contains(EMPTY_SCENE));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_dialogue_stops_speaking_at_malformed_output() {
    let dialogue = concat!(
        r#"{"utterances":[{"speaker":"novice","utterance":"Is that a cube?"},"#,
        r#"{"speaker":"expert","utterance":"Yes, a red one."},"#,
        r#"{"speaker":"novice" ### "utterance":"lost"},"#,
        r#"{"speaker":"expert","utterance":"Never spoken."}]}"#,
    );
    let transport = Arc::new(ScriptedTransport::with_scripts([
        Script::new().content_chunks(dialogue, 5),
    ]));
    let (audio, spoken) = ChannelAudioSink::bounded(8);

    let handle = Stagehand::builder(transport)
        .with_config(StagehandConfig::default().without_images())
        .with_audio_sink(Arc::new(audio))
        .build()
        .unwrap()
        .start();
    let mut events = handle.dialogue_events();

    assert!(handle.simulate("").unwrap());
    assert!(matches!(
        settled(&mut events, 1).await,
        PipelineEvent::TurnCommitted { .. }
    ));

    let heard: Vec<String> = spoken.try_iter().collect();
    assert_eq!(heard, vec!["Is that a cube?", "Yes, a red one."]);
    assert_eq!(
        handle.transcript().content,
        "novice: Is that a cube?\nexpert: Yes, a red one."
    );
    assert!(!handle.transcript().content.contains("Never spoken"));

    handle.shutdown().await;
}

#[tokio::test]
async fn test_empty_dialogue_keeps_previous_transcript() {
    let first = r#"{"utterances":[{"speaker":"expert","utterance":"Hello."}]}"#;
    let transport = Arc::new(ScriptedTransport::with_scripts([
        Script::new().content(first),
        Script::new().content(r#"{"utterances":[]}"#),
    ]));

    let handle = Stagehand::builder(transport)
        .with_config(StagehandConfig::default().without_images())
        .build()
        .unwrap()
        .start();
    let mut events = handle.dialogue_events();

    handle.simulate("").unwrap();
    settled(&mut events, 1).await;
    handle.simulate("").unwrap();
    assert!(matches!(
        settled(&mut events, 2).await,
        PipelineEvent::TurnCompleted { .. }
    ));

    assert_eq!(handle.transcript().content, "expert: Hello.");
    assert_eq!(handle.transcript().revision, 1);
    assert!(handle.dialogue_status().queued.is_empty());
    handle.shutdown().await;
}
