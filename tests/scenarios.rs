//! End-to-end scenarios across the full engine surface: storage, index,
//! events, triggers, queue, orchestrator and synthesis working together in
//! one workspace.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use tempfile::tempdir;

use cube::agents::AgentSpec;
use cube::codec;
use cube::events::EventLogConfig;
use cube::synthesis::Recommendation;
use cube::triggers::TriggerAction;
use cube::{
    AgentRegistry, AgentStatus, ClaimRequest, EdgeDirection, EdgeFilter, EdgeType, Event,
    EventBus, EventKind, EventLog, Graph, GraphOptions, NewNode, NodeType, NodeUpdate,
    PipelineOptions, Priority, QueryOptions, ReleaseRequest, Status, SynthesisPipeline,
    SynthesisSource, Trigger, TriggerEngine, TraverseOptions, Validity, WorkQueue, WorkStatus,
};

struct Workspace {
    _dir: tempfile::TempDir,
    bus: Arc<EventBus>,
    graph: Arc<Graph>,
    registry: Arc<AgentRegistry>,
    queue: Arc<WorkQueue>,
    log: Arc<EventLog>,
}

fn workspace() -> Workspace {
    let dir = tempdir().unwrap();
    let bus = Arc::new(EventBus::new());
    let graph = Arc::new(
        Graph::init_with_bus(dir.path(), GraphOptions::default(), Some(bus.clone())).unwrap(),
    );
    let registry = Arc::new(AgentRegistry::open(dir.path(), bus.clone()).unwrap());
    let queue = Arc::new(WorkQueue::new(graph.clone(), registry.clone(), bus.clone()));
    let log = Arc::new(
        EventLog::open(&dir.path().join("events.log"), EventLogConfig::default()).unwrap(),
    );
    Workspace {
        _dir: dir,
        bus,
        graph,
        registry,
        queue,
        log,
    }
}

fn coder(ws: &Workspace, id: &str, heartbeat_interval_ms: i64) {
    ws.registry
        .register(AgentSpec {
            id: id.into(),
            name: id.into(),
            role: "coder".into(),
            heartbeat_interval_ms: Some(heartbeat_interval_ms),
            ..AgentSpec::default()
        })
        .unwrap();
}

// S1 — round-trip through the file format.
#[test]
fn created_task_round_trips_through_its_file() {
    let ws = workspace();
    let mut input = NewNode::new(NodeType::Task, "Implement authentication");
    input.priority = Some(Priority::High);
    input.tags = vec!["api".into()];
    input.content = Some("Support OAuth and sessions.".into());
    let node = ws.graph.create(input).unwrap();

    let id_re = regex::Regex::new(r"^task/implement-authentication-[0-9a-f]{6}$").unwrap();
    assert!(id_re.is_match(&node.id), "unexpected id {}", node.id);
    assert_eq!(node.ordering.semantic_hash.len(), 16);

    let text = codec::encode(&node);
    assert!(text.contains("status: pending"));
    assert!(text.contains("validity: current"));
    assert!(text.contains("version: 1"));
    assert!(text.contains("priority: high"));
    assert!(text.contains("tags: [\"api\"]"));

    let decoded = codec::decode(&text, "nodes/task/x.md").unwrap();
    assert_eq!(decoded.id, node.id);
    assert_eq!(decoded.title, node.title);
    assert_eq!(decoded.content, node.content);
    assert_eq!(decoded.tags, vec!["api"]);
    assert_eq!(decoded.version, 1);
    assert_eq!(decoded.status, Status::Pending);
    assert_eq!(decoded.validity, Validity::Current);
}

// S2 — edge coherence after deleting the target.
#[test]
fn deleting_an_edge_target_keeps_source_queryable_and_traversal_clean() {
    let ws = workspace();
    let a = ws.graph.create(NewNode::new(NodeType::Task, "A")).unwrap();
    let b = ws.graph.create(NewNode::new(NodeType::Task, "B")).unwrap();
    ws.graph
        .link(&a.id, EdgeType::DependsOn, &b.id, None)
        .unwrap();
    ws.graph.delete(&b.id).unwrap();

    let opts = QueryOptions {
        has_edge: Some(EdgeFilter {
            edge_type: EdgeType::DependsOn,
            direction: EdgeDirection::Out,
        }),
        ..QueryOptions::default()
    };
    assert_eq!(ws.graph.query_ids(&opts).unwrap(), vec![a.id.clone()]);

    let mut traverse = TraverseOptions::new(&a.id);
    traverse.edge_types = vec![EdgeType::DependsOn];
    let steps = ws.graph.traverse(&traverse).unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].node.id, a.id);
}

// S3 — trigger fan-out: code update invalidates its documentation.
#[test]
fn code_update_marks_documenting_node_stale_via_trigger() {
    let ws = workspace();
    let engine = TriggerEngine::new(ws.graph.clone(), ws.log.clone(), ws.bus.clone());
    engine.attach();

    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();
    ws.bus.subscribe("trigger.fired", move |event| {
        if let EventKind::TriggerFired { actions, .. } = &event.kind {
            sink.lock().unwrap().push(actions.clone());
        }
        Ok(())
    });

    let mut rule = Trigger::new("t1", "invalidate docs", vec!["node.updated".into()]);
    rule.conditions.node_type = vec![NodeType::Code];
    rule.actions = vec![TriggerAction::new("invalidate")];
    engine.add_trigger(rule).unwrap();

    let c1 = ws
        .graph
        .create(NewNode::new(NodeType::Code, "parser module"))
        .unwrap();
    let d1 = ws
        .graph
        .create(NewNode::new(NodeType::Doc, "parser docs"))
        .unwrap();
    ws.graph
        .link(&d1.id, EdgeType::Documents, &c1.id, None)
        .unwrap();

    ws.graph
        .update(
            &c1.id,
            &NodeUpdate {
                content: Some("new parser internals".into()),
                ..NodeUpdate::default()
            },
        )
        .unwrap();

    assert_eq!(ws.graph.get(&d1.id).unwrap().validity, Validity::Stale);

    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0], vec!["invalidate".to_string()]);

    let activated: Vec<_> = ws
        .log
        .read_all()
        .unwrap()
        .into_iter()
        .filter(|e| e.triggers_activated.contains(&"t1".to_string()))
        .collect();
    assert_eq!(activated.len(), 1);
    assert_eq!(activated[0].event.event_type(), "node.updated");
}

// S4 — computed priority ordering and exclusive claims.
#[test]
fn queue_orders_by_computed_priority_and_rejects_second_claim() {
    let ws = workspace();
    coder(&ws, "first", 30_000);
    coder(&ws, "second", 30_000);

    let mut t1 = NewNode::new(NodeType::Task, "t1 critical");
    t1.priority = Some(Priority::Critical);
    let t1 = ws.graph.create(t1).unwrap();

    let mut t2 = NewNode::new(NodeType::Task, "t2 overdue");
    t2.priority = Some(Priority::High);
    t2.due_at = Some(Utc::now() - Duration::hours(1));
    let t2 = ws.graph.create(t2).unwrap();

    let mut t3 = NewNode::new(NodeType::Task, "t3 plain");
    t3.priority = Some(Priority::High);
    let t3 = ws.graph.create(t3).unwrap();

    for id in [&t1.id, &t2.id, &t3.id] {
        ws.queue.enqueue(id, Default::default()).unwrap();
    }

    // critical base 1000 > overdue high 100+500 > plain high 100
    let order: Vec<String> = {
        let mut order = Vec::new();
        for _ in 0..3 {
            let next = ws.queue.get_next_for("first").unwrap().unwrap();
            order.push(next.task_id.clone());
            ws.queue
                .claim(&ClaimRequest {
                    agent_id: "first".into(),
                    task_id: next.task_id.clone(),
                    timeout_ms: None,
                })
                .unwrap();
            ws.queue
                .release(&ReleaseRequest {
                    agent_id: "first".into(),
                    task_id: next.task_id,
                    reason: "completed".into(),
                    new_status: None,
                    error: None,
                })
                .unwrap();
        }
        order
    };
    assert_eq!(order, vec![t1.id.clone(), t2.id.clone(), t3.id.clone()]);

    // Fresh contested task: one claim wins, the other conflicts.
    let contested = ws
        .graph
        .create(NewNode::new(NodeType::Task, "contested"))
        .unwrap();
    ws.queue.enqueue(&contested.id, Default::default()).unwrap();
    ws.queue
        .claim(&ClaimRequest {
            agent_id: "first".into(),
            task_id: contested.id.clone(),
            timeout_ms: None,
        })
        .unwrap();
    let err = ws
        .queue
        .claim(&ClaimRequest {
            agent_id: "second".into(),
            task_id: contested.id.clone(),
            timeout_ms: None,
        })
        .unwrap_err();
    assert!(err.is_conflict());
}

// S5 — claim timeout releases the task and frees the agent.
#[test]
fn expired_claim_returns_to_queue_and_emits_work_expired() {
    let ws = workspace();
    coder(&ws, "coder", 1000);

    let expired_events = Arc::new(AtomicUsize::new(0));
    let sink = expired_events.clone();
    ws.bus.subscribe("work.expired", move |_| {
        sink.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    });

    let t1 = ws.graph.create(NewNode::new(NodeType::Task, "t1")).unwrap();
    ws.queue.enqueue(&t1.id, Default::default()).unwrap();
    ws.queue
        .claim(&ClaimRequest {
            agent_id: "coder".into(),
            task_id: t1.id.clone(),
            timeout_ms: Some(50),
        })
        .unwrap();

    std::thread::sleep(std::time::Duration::from_millis(200));
    let released = ws.queue.check_expired().unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].status, WorkStatus::Queued);

    let item = ws.queue.find_by_task(&t1.id).unwrap();
    assert_eq!(item.status, WorkStatus::Queued);
    assert!(item.claimed_by.is_none());
    assert_eq!(ws.registry.get("coder").unwrap().1.status, AgentStatus::Idle);
    assert_eq!(ws.graph.get(&t1.id).unwrap().status, Status::Pending);
    assert_eq!(expired_events.load(AtomicOrdering::SeqCst), 1);
}

// S6 — synthesis dedup merges instead of creating a near-duplicate.
#[test]
fn synthesis_merges_near_duplicate_into_existing_task() {
    let ws = workspace();
    let pipeline = SynthesisPipeline::new(ws.graph.clone(), PipelineOptions::default());

    let mut existing = NewNode::new(NodeType::Task, "add login");
    existing.content = Some("add login to the api".into());
    existing.tags = vec!["api".into(), "auth".into()];
    let existing = ws.graph.create(existing).unwrap();

    let (candidates, relations) = pipeline
        .process(&[SynthesisSource::Conversation {
            text: "we need to add login to the api".into(),
        }])
        .unwrap();
    assert_eq!(candidates.len(), 1);
    assert!(candidates[0].matches[0].similarity >= 0.8);
    assert_eq!(
        candidates[0].recommendation,
        Recommendation::Merge {
            target: existing.id.clone()
        }
    );

    let before = ws.graph.stats().unwrap().total;
    let outcome = pipeline.create_nodes(&candidates, &relations, None).unwrap();
    assert!(outcome.created.is_empty());
    assert_eq!(ws.graph.stats().unwrap().total, before);

    let merged = ws.graph.get(&existing.id).unwrap();
    assert!(merged.version > existing.version);
    assert!(merged.content.contains("we need to add login to the api"));
    assert!(merged.tags.contains(&"api".to_string()));
    assert!(merged.tags.contains(&"auth".to_string()));
}

// P2 — a full lifecycle leaves no artifacts behind.
#[test]
fn create_update_update_delete_leaves_no_artifacts() {
    let ws = workspace();
    let node = ws
        .graph
        .create(NewNode::new(NodeType::Task, "Ephemeral"))
        .unwrap();
    let rel = node.file_path.clone().unwrap();

    ws.graph
        .update(
            &node.id,
            &NodeUpdate {
                content: Some("first".into()),
                ..NodeUpdate::default()
            },
        )
        .unwrap();
    ws.graph
        .update(
            &node.id,
            &NodeUpdate {
                status: Some(Status::Active),
                ..NodeUpdate::default()
            },
        )
        .unwrap();
    ws.graph.delete(&node.id).unwrap();

    assert!(!ws._dir.path().join(&rel).exists());
    assert!(ws.graph.query_ids(&QueryOptions::default()).unwrap().is_empty());
    assert!(ws.graph.get(&node.id).is_err());
}

// P3 — rebuild reproduces the incrementally maintained index.
#[test]
fn rebuild_matches_incrementally_maintained_index() {
    let ws = workspace();
    let a = ws.graph.create(NewNode::new(NodeType::Task, "A")).unwrap();
    let mut b = NewNode::new(NodeType::Doc, "B");
    b.tags = vec!["api".into()];
    let b = ws.graph.create(b).unwrap();
    ws.graph.link(&a.id, EdgeType::Documents, &b.id, None).unwrap();
    ws.graph
        .update(
            &a.id,
            &NodeUpdate {
                status: Some(Status::Active),
                ..NodeUpdate::default()
            },
        )
        .unwrap();

    let snapshot = |graph: &Graph| {
        let all = graph.query_ids(&QueryOptions::default()).unwrap();
        let tagged = graph
            .query_ids(&QueryOptions {
                tags: vec!["api".into()],
                ..QueryOptions::default()
            })
            .unwrap();
        let linked = graph
            .query_ids(&QueryOptions {
                has_edge: Some(EdgeFilter {
                    edge_type: EdgeType::Documents,
                    direction: EdgeDirection::Out,
                }),
                ..QueryOptions::default()
            })
            .unwrap();
        (all, tagged, linked)
    };

    let before: (Vec<String>, Vec<String>, Vec<String>) = {
        let (mut a, b, c) = snapshot(&ws.graph);
        a.sort();
        (a, b, c)
    };
    let (count, errors) = ws.graph.rebuild_index().unwrap();
    assert_eq!(count, 2);
    assert!(errors.is_empty());
    let after = {
        let (mut a, b, c) = snapshot(&ws.graph);
        a.sort();
        (a, b, c)
    };
    assert_eq!(before, after);
}

// P4 — link/unlink is a no-op pair; double link conflicts.
#[test]
fn link_unlink_pair_is_a_no_op_and_double_link_conflicts() {
    let ws = workspace();
    let a = ws.graph.create(NewNode::new(NodeType::Task, "A")).unwrap();
    let b = ws.graph.create(NewNode::new(NodeType::Task, "B")).unwrap();

    ws.graph.link(&a.id, EdgeType::Blocks, &b.id, None).unwrap();
    let err = ws.graph.link(&a.id, EdgeType::Blocks, &b.id, None).unwrap_err();
    assert!(err.is_conflict());

    let restored = ws.graph.unlink(&a.id, EdgeType::Blocks, &b.id).unwrap();
    assert_eq!(restored.edges, a.edges);
    let opts = QueryOptions {
        has_edge: Some(EdgeFilter {
            edge_type: EdgeType::Blocks,
            direction: EdgeDirection::Out,
        }),
        ..QueryOptions::default()
    };
    assert!(ws.graph.query_ids(&opts).unwrap().is_empty());
}

// P9 — cooldown bounds trigger firing under an event storm.
#[test]
fn trigger_with_cooldown_fires_once_per_window() {
    let ws = workspace();
    let engine = TriggerEngine::new(ws.graph.clone(), ws.log.clone(), ws.bus.clone());
    engine.attach();

    let fired = Arc::new(AtomicUsize::new(0));
    let sink = fired.clone();
    ws.bus.subscribe("trigger.fired", move |_| {
        sink.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    });

    let mut rule = Trigger::new("storm", "storm", vec!["node.created".into()]);
    rule.cooldown_ms = 60_000;
    rule.actions = vec![TriggerAction::new("log")
        .with_param("message", serde_json::json!("created {{event.node.id}}"))];
    engine.add_trigger(rule).unwrap();

    for i in 0..10 {
        ws.graph
            .create(NewNode::new(NodeType::Task, format!("storm {i}")))
            .unwrap();
    }
    assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);
}

// P14 — extraction confidences stay in range and spans never overlap.
#[test]
fn extraction_confidences_and_spans_are_well_formed() {
    let ws = workspace();
    let pipeline = SynthesisPipeline::new(
        ws.graph.clone(),
        PipelineOptions {
            min_confidence: 0.0,
            ..PipelineOptions::default()
        },
    );
    let result = pipeline.extract(&[SynthesisSource::Conversation {
        text: "user: we need to ship the beta asap\n\
               assistant: we decided to cut scope. todo: update the roadmap\n\
               user: what if we delayed the launch? how would users react?"
            .into(),
    }]);

    assert!(!result.nodes.is_empty());
    let mut spans: Vec<(usize, usize)> = result.nodes.iter().map(|n| n.span).collect();
    spans.sort();
    for pair in spans.windows(2) {
        assert!(pair[0].1 <= pair[1].0);
    }
    for node in &result.nodes {
        assert!((0.0..=1.0).contains(&node.confidence));
    }
}

// Approval gating keeps unapproved candidates out of the graph.
#[test]
fn approval_gated_pipeline_only_applies_approved_candidates() {
    let ws = workspace();
    let pipeline = SynthesisPipeline::new(
        ws.graph.clone(),
        PipelineOptions {
            require_approval: true,
            ..PipelineOptions::default()
        },
    );
    let (candidates, relations) = pipeline
        .process(&[SynthesisSource::Conversation {
            text: "todo: write the deploy script. todo: document the release flow".into(),
        }])
        .unwrap();
    assert_eq!(candidates.len(), 2);

    let approved: HashSet<usize> = [0].into_iter().collect();
    let outcome = pipeline
        .create_nodes(&candidates, &relations, Some(&approved))
        .unwrap();
    assert_eq!(outcome.created.len(), 1);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(ws.graph.stats().unwrap().total, 1);
}

// Events flow from every subsystem into one shared bus.
#[test]
fn one_bus_sees_graph_queue_and_agent_events() {
    let ws = workspace();
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = seen.clone();
    ws.bus.subscribe("*", move |event: &Event| {
        sink.lock().unwrap().push(event.event_type().to_string());
        Ok(())
    });

    coder(&ws, "coder", 30_000);
    let task = ws.graph.create(NewNode::new(NodeType::Task, "Wired")).unwrap();
    ws.queue.enqueue(&task.id, Default::default()).unwrap();
    ws.queue
        .claim(&ClaimRequest {
            agent_id: "coder".into(),
            task_id: task.id.clone(),
            timeout_ms: None,
        })
        .unwrap();
    ws.queue
        .release(&ReleaseRequest {
            agent_id: "coder".into(),
            task_id: task.id,
            reason: "completed".into(),
            new_status: None,
            error: None,
        })
        .unwrap();

    let seen = seen.lock().unwrap();
    for expected in [
        "agent.registered",
        "node.created",
        "work.enqueued",
        "work.claimed",
        "agent.status_changed",
        "node.status_changed",
        "work.completed",
        "work.released",
    ] {
        assert!(seen.contains(&expected.to_string()), "missing {expected}");
    }
}
