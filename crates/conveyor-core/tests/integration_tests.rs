//! End-to-end tests driving the engine through in-memory repositories.

use conveyor_core::domain::repository::memory::{
    FixedTenant, LoggingNotificationSender, MemoryApprovalRepository, MemoryContextRepository,
    MemoryDefinitionRepository, MemoryInstanceRepository, MemoryStepRepository, MemoryTaskQueue,
    StaticUserDirectory,
};
use conveyor_core::executors::EchoServiceGateway;
use conveyor_core::{
    ApprovalRepository, ChainId, ChainStatus, DataPacket, DefinitionRepository, DefinitionStatus,
    EdgeDefinition, EngineDependencies, EngineError, InstanceRepository, InstanceStatus,
    LoggingEventHandler, NodeDefinition, NodeId, NodeType, Priority, ProcessDefinition,
    ProcessDefinitionId, ProcessEngine, ProcessInstanceId, QueuePayload, StepStatus, TenantId,
    UserId,
};
use serde_json::{json, Value};
use std::sync::Arc;

struct Harness {
    engine: Arc<ProcessEngine>,
    definitions: Arc<MemoryDefinitionRepository>,
    instances: Arc<MemoryInstanceRepository>,
    queue: Arc<MemoryTaskQueue>,
    approvals: Arc<MemoryApprovalRepository>,
}

fn harness(directory: StaticUserDirectory) -> Harness {
    let definitions = Arc::new(MemoryDefinitionRepository::new());
    let instances = Arc::new(MemoryInstanceRepository::new());
    let steps = Arc::new(MemoryStepRepository::new());
    let approvals = Arc::new(MemoryApprovalRepository::new());
    let queue = Arc::new(MemoryTaskQueue::new());

    let engine = ProcessEngine::new(EngineDependencies {
        definitions: definitions.clone(),
        instances: instances.clone(),
        steps: steps.clone(),
        approvals: approvals.clone(),
        contexts: Arc::new(MemoryContextRepository::new()),
        queue: Some(queue.clone()),
        directory: Arc::new(directory),
        notifications: Arc::new(LoggingNotificationSender),
        tenant: Arc::new(FixedTenant(TenantId("acme".to_string()))),
        service_gateway: Arc::new(EchoServiceGateway),
        event_handler: Arc::new(LoggingEventHandler),
    });

    Harness {
        engine,
        definitions,
        instances,
        queue,
        approvals,
    }
}

impl Harness {
    async fn deploy(&self, definition: ProcessDefinition) {
        self.definitions.save(&definition).await.unwrap();
    }

    async fn start(&self, definition_id: &str, input: Value) -> ProcessInstanceId {
        self.engine
            .start_process(
                &ProcessDefinitionId(definition_id.to_string()),
                DataPacket::new(input),
                Some(UserId("tester".to_string())),
                Priority::Normal,
            )
            .await
            .unwrap()
    }

    async fn status(&self, instance_id: &ProcessInstanceId) -> InstanceStatus {
        self.engine.get_instance(instance_id).await.unwrap().status
    }

    async fn step_nodes(&self, instance_id: &ProcessInstanceId) -> Vec<String> {
        self.engine
            .get_steps(instance_id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.node_id.0)
            .collect()
    }

    /// Deliver every queued payload back into the engine, repeatedly,
    /// until the queue stays empty
    async fn pump(&self) {
        loop {
            let batch = self.queue.drain();
            if batch.is_empty() {
                return;
            }
            for scheduled in batch {
                self.engine.handle_callback(scheduled.payload).await.unwrap();
            }
        }
    }
}

fn definition(id: &str, nodes: Vec<NodeDefinition>, edges: Vec<(&str, &str, Option<&str>)>) -> ProcessDefinition {
    ProcessDefinition {
        id: ProcessDefinitionId(id.to_string()),
        name: id.to_string(),
        version: 1,
        status: DefinitionStatus::Active,
        nodes,
        edges: edges
            .into_iter()
            .map(|(source, target, condition)| EdgeDefinition {
                source: NodeId(source.to_string()),
                target: NodeId(target.to_string()),
                condition: condition.map(str::to_string),
            })
            .collect(),
    }
}

fn node(id: &str, node_type: NodeType, properties: Value) -> NodeDefinition {
    NodeDefinition {
        id: NodeId(id.to_string()),
        node_type,
        properties,
    }
}

fn script_node(id: &str, script: &str, result_variable: Option<&str>) -> NodeDefinition {
    let mut properties = json!({"service_type": "script", "script": script});
    if let Some(variable) = result_variable {
        properties["result_variable"] = json!(variable);
    }
    node(id, NodeType::Service, properties)
}

#[tokio::test]
async fn test_linear_process_runs_to_completion() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "order-check",
        vec![
            script_node("compute", "amount * 2", Some("doubled")),
            script_node("finish", "doubled + 1", None),
        ],
        vec![("compute", "finish", None)],
    ))
    .await;

    let id = h.start("order-check", json!({"amount": 21})).await;

    assert_eq!(h.status(&id).await, InstanceStatus::Completed);
    let steps = h.engine.get_steps(&id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));

    let instance = h.engine.get_instance(&id).await.unwrap();
    let output = instance.output_data.unwrap();
    assert_eq!(output.as_value()["result"], json!(43));

    // Context survives completion in the repository
    let doubled = h
        .engine
        .context()
        .get(&id, "doubled", None, true)
        .await
        .unwrap();
    assert_eq!(doubled, json!(42));
    let system = h
        .engine
        .context()
        .get(&id, "system.instance_id", None, true)
        .await
        .unwrap();
    assert_eq!(system, json!(id.0));
}

#[tokio::test]
async fn test_gateway_routes_only_the_matching_branch() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "routing",
        vec![
            node(
                "route",
                NodeType::Gateway,
                json!({"conditions": [
                    {"target": "task_x", "expression": "amount > 100"},
                    {"target": "task_y", "default": true}
                ]}),
            ),
            script_node("task_x", "'high'", Some("lane")),
            script_node("task_y", "'low'", Some("lane")),
        ],
        vec![("route", "task_x", None), ("route", "task_y", None)],
    ))
    .await;

    let id = h.start("routing", json!({"amount": 150})).await;
    h.pump().await;

    assert_eq!(h.status(&id).await, InstanceStatus::Completed);
    let nodes = h.step_nodes(&id).await;
    assert!(nodes.contains(&"task_x".to_string()));
    assert!(!nodes.contains(&"task_y".to_string()));
}

#[tokio::test]
async fn test_gateway_undefined_variable_takes_the_default() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "routing-default",
        vec![
            node(
                "route",
                NodeType::Gateway,
                json!({"conditions": [
                    {"target": "task_x", "expression": "never_set > 100"},
                    {"target": "task_y", "default": true}
                ]}),
            ),
            script_node("task_x", "1", None),
            script_node("task_y", "2", None),
        ],
        vec![("route", "task_x", None), ("route", "task_y", None)],
    ))
    .await;

    let id = h.start("routing-default", json!({})).await;
    h.pump().await;

    let nodes = h.step_nodes(&id).await;
    assert!(nodes.contains(&"task_y".to_string()));
    assert!(!nodes.contains(&"task_x".to_string()));
}

#[tokio::test]
async fn test_parallel_approval_completes_at_threshold() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "expense",
        vec![
            node(
                "approve",
                NodeType::Approval,
                json!({
                    "chain_type": "parallel",
                    "approvers": [
                        {"kind": "user", "user_id": "u1"},
                        {"kind": "user", "user_id": "u2"},
                        {"kind": "user", "user_id": "u3"}
                    ],
                    "approval_threshold": 2
                }),
            ),
            script_node("pay", "'paid'", Some("outcome")),
        ],
        vec![("approve", "pay", Some("approved == true"))],
    ))
    .await;

    let id = h.start("expense", json!({"amount": 900})).await;
    assert_eq!(h.status(&id).await, InstanceStatus::Running);

    let steps = h.engine.get_steps(&id).await.unwrap();
    let chain_id = ChainId(steps[0].approval_chain_id.clone().unwrap());
    let requests = h.approvals.find_requests_by_chain(&chain_id).await.unwrap();
    assert_eq!(requests.len(), 3);

    let first = h
        .engine
        .submit_approval_decision(&requests[0].id, true, &UserId("u1".to_string()), None)
        .await
        .unwrap();
    assert_eq!(first, ChainStatus::Pending);
    assert_eq!(h.status(&id).await, InstanceStatus::Running);

    let second = h
        .engine
        .submit_approval_decision(&requests[1].id, true, &UserId("u2".to_string()), None)
        .await
        .unwrap();
    assert_eq!(second, ChainStatus::Approved);

    h.pump().await;
    assert_eq!(h.status(&id).await, InstanceStatus::Completed);
    assert!(h.step_nodes(&id).await.contains(&"pay".to_string()));
}

#[tokio::test]
async fn test_sequential_rejection_never_reaches_later_approvers() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "review",
        vec![
            node(
                "approve",
                NodeType::Approval,
                json!({
                    "chain_type": "sequential",
                    "approvers": [
                        {"kind": "user", "user_id": "u1"},
                        {"kind": "user", "user_id": "u2"},
                        {"kind": "user", "user_id": "u3"}
                    ]
                }),
            ),
            script_node("accepted", "1", None),
            script_node("declined", "2", None),
        ],
        vec![
            ("approve", "accepted", Some("approved == true")),
            ("approve", "declined", Some("approved == false")),
        ],
    ))
    .await;

    let id = h.start("review", json!({})).await;
    let steps = h.engine.get_steps(&id).await.unwrap();
    let chain_id = ChainId(steps[0].approval_chain_id.clone().unwrap());

    let requests = h.approvals.find_requests_by_chain(&chain_id).await.unwrap();
    assert_eq!(requests.len(), 1, "only the first approver has a request");

    let status = h
        .engine
        .submit_approval_decision(&requests[0].id, false, &UserId("u1".to_string()), None)
        .await
        .unwrap();
    assert_eq!(status, ChainStatus::Rejected);

    // Rejection at the first slot never created the later requests
    let requests = h.approvals.find_requests_by_chain(&chain_id).await.unwrap();
    assert_eq!(requests.len(), 1);

    h.pump().await;
    assert_eq!(h.status(&id).await, InstanceStatus::Completed);
    let nodes = h.step_nodes(&id).await;
    assert!(nodes.contains(&"declined".to_string()));
    assert!(!nodes.contains(&"accepted".to_string()));
}

#[tokio::test]
async fn test_approval_timeout_sweep_rejects_and_resumes() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "expiring",
        vec![
            node(
                "approve",
                NodeType::Approval,
                json!({
                    "chain_type": "parallel",
                    "approvers": [{"kind": "user", "user_id": "u1"}],
                    "timeout_action": "reject",
                    "timeout_seconds": 0
                }),
            ),
            script_node("declined", "1", None),
        ],
        vec![("approve", "declined", Some("approved == false"))],
    ))
    .await;

    let id = h.start("expiring", json!({})).await;
    assert_eq!(h.status(&id).await, InstanceStatus::Running);

    h.engine
        .handle_callback(QueuePayload::SweepApprovals)
        .await
        .unwrap();
    h.pump().await;

    let steps = h.engine.get_steps(&id).await.unwrap();
    let chain_id = ChainId(steps[0].approval_chain_id.clone().unwrap());
    assert_eq!(
        h.engine.get_chain_status(&chain_id).await.unwrap(),
        ChainStatus::Rejected
    );
    assert_eq!(h.status(&id).await, InstanceStatus::Completed);
    assert!(h.step_nodes(&id).await.contains(&"declined".to_string()));
}

#[tokio::test]
async fn test_zero_second_timeout_timer_fails_the_instance() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "deadline",
        vec![node(
            "expire",
            NodeType::Timer,
            json!({
                "timer_type": "timeout",
                "timeout_seconds": 0,
                "timeout_action": "reject"
            }),
        )],
        vec![],
    ))
    .await;

    let id = h.start("deadline", json!({})).await;

    let instance = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert!(instance.last_error.unwrap().contains("Step timed out"));
    let steps = h.engine.get_steps(&id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
}

#[tokio::test]
async fn test_resume_is_rejected_while_running() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "manual",
        vec![node("fill_in", NodeType::Task, json!({"assignee": "alice"}))],
        vec![],
    ))
    .await;

    let id = h.start("manual", json!({})).await;
    assert_eq!(h.status(&id).await, InstanceStatus::Running);

    let result = h.engine.resume_process(&id, None, None).await;
    assert!(matches!(result, Err(EngineError::StateTransition(_))));

    // Suspend, then resume, then finish the task normally
    assert!(h.engine.suspend_process(&id, None).await.unwrap());
    assert_eq!(h.status(&id).await, InstanceStatus::Suspended);
    assert!(h.engine.resume_process(&id, None, None).await.unwrap());
    assert_eq!(h.status(&id).await, InstanceStatus::Running);

    let waiting: Vec<_> = h
        .engine
        .get_steps(&id)
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.status == StepStatus::Waiting)
        .collect();
    assert!(!waiting.is_empty());
    for step in waiting {
        h.engine
            .complete_external_task(&step.id, DataPacket::new(json!({"form": "done"})))
            .await
            .unwrap();
    }
    assert_eq!(h.status(&id).await, InstanceStatus::Completed);
}

#[tokio::test]
async fn test_call_activity_waits_for_the_child() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "child-def",
        vec![script_node("work", "amount + 1", Some("bumped"))],
        vec![],
    ))
    .await;
    h.deploy(definition(
        "parent-def",
        vec![
            node(
                "call",
                NodeType::Subprocess,
                json!({
                    "subprocess_type": "call_activity",
                    "definition_id": "child-def",
                    "wait_for_completion": true
                }),
            ),
            script_node("after", "1", None),
        ],
        vec![("call", "after", None)],
    ))
    .await;

    let parent_id = h.start("parent-def", json!({"amount": 9})).await;

    assert_eq!(h.status(&parent_id).await, InstanceStatus::Completed);
    let children = h.instances.find_children(&parent_id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].status, InstanceStatus::Completed);
    assert_eq!(
        children[0].definition_id,
        ProcessDefinitionId("child-def".to_string())
    );

    // The subprocess step carries the child's output forward
    let steps = h.engine.get_steps(&parent_id).await.unwrap();
    let call_step = steps.iter().find(|s| s.node_id.0 == "call").unwrap();
    assert_eq!(call_step.status, StepStatus::Completed);
    assert_eq!(
        call_step.output_data.as_ref().unwrap().as_value()["result"],
        json!(10)
    );
}

#[tokio::test]
async fn test_child_failure_fails_the_waiting_parent() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "doomed-child",
        vec![node(
            "expire",
            NodeType::Timer,
            json!({"timer_type": "timeout", "timeout_seconds": 0, "timeout_action": "fail"}),
        )],
        vec![],
    ))
    .await;
    h.deploy(definition(
        "hopeful-parent",
        vec![node(
            "call",
            NodeType::Subprocess,
            json!({
                "subprocess_type": "call_activity",
                "definition_id": "doomed-child"
            }),
        )],
        vec![],
    ))
    .await;

    let parent_id = h.start("hopeful-parent", json!({})).await;

    let parent = h.engine.get_instance(&parent_id).await.unwrap();
    assert_eq!(parent.status, InstanceStatus::Failed);
    assert!(parent.last_error.unwrap().contains("failed"));
    let children = h.instances.find_children(&parent_id).await.unwrap();
    assert_eq!(children[0].status, InstanceStatus::Failed);
}

#[tokio::test]
async fn test_event_subprocess_resumes_on_dispatch() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "invoice",
        vec![
            node(
                "await_payment",
                NodeType::Subprocess,
                json!({"subprocess_type": "event", "event_name": "invoice.paid"}),
            ),
            script_node("close", "1", None),
        ],
        vec![("await_payment", "close", None)],
    ))
    .await;

    let id = h.start("invoice", json!({})).await;
    assert_eq!(h.status(&id).await, InstanceStatus::Running);

    let resumed = h
        .engine
        .dispatch_event("invoice.paid", DataPacket::new(json!({"paid": true})), None)
        .await
        .unwrap();
    assert_eq!(resumed, vec![id.clone()]);
    assert_eq!(h.status(&id).await, InstanceStatus::Completed);

    // A second dispatch finds nothing to resume
    let resumed = h
        .engine
        .dispatch_event("invoice.paid", DataPacket::null(), None)
        .await
        .unwrap();
    assert!(resumed.is_empty());
}

#[tokio::test]
async fn test_embedded_subprocess_runs_inline() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "wrapper",
        vec![node(
            "inline",
            NodeType::Subprocess,
            json!({
                "subprocess_type": "embedded",
                "nodes": [
                    {"id": "a", "type": "service",
                     "properties": {"service_type": "script", "script": "1 + 2",
                                    "result_variable": "sum"}}
                ],
                "edges": []
            }),
        )],
        vec![],
    ))
    .await;

    let id = h.start("wrapper", json!({})).await;

    assert_eq!(h.status(&id).await, InstanceStatus::Completed);
    let sum = h.engine.context().get(&id, "sum", None, true).await.unwrap();
    assert_eq!(sum, json!(3));
    // Both the wrapper step and the inline node's step are recorded
    let nodes = h.step_nodes(&id).await;
    assert!(nodes.contains(&"inline".to_string()));
    assert!(nodes.contains(&"a".to_string()));
}

#[tokio::test]
async fn test_retry_strategy_backs_off_then_exhausts() {
    let h = harness(StaticUserDirectory::new());
    // A gateway with no conditions always fails validation at execution
    h.deploy(definition(
        "flaky",
        vec![node(
            "broken",
            NodeType::Gateway,
            json!({
                "conditions": [],
                "error_strategy": "retry",
                "max_attempts": 2,
                "backoff_seconds": 1
            }),
        )],
        vec![],
    ))
    .await;

    let id = h.start("flaky", json!({})).await;
    assert_eq!(h.status(&id).await, InstanceStatus::Running);

    // First failure scheduled attempt 1
    let batch = h.queue.drain();
    assert_eq!(batch.len(), 1);
    match &batch[0].payload {
        QueuePayload::RetryStep { attempt, .. } => assert_eq!(*attempt, 1),
        other => panic!("Unexpected payload: {:?}", other),
    }
    h.engine
        .handle_callback(batch.into_iter().next().unwrap().payload)
        .await
        .unwrap();

    // Second failure scheduled attempt 2; its failure exhausts the budget
    let batch = h.queue.drain();
    match &batch[0].payload {
        QueuePayload::RetryStep { attempt, .. } => assert_eq!(*attempt, 2),
        other => panic!("Unexpected payload: {:?}", other),
    }
    h.engine
        .handle_callback(batch.into_iter().next().unwrap().payload)
        .await
        .unwrap();

    assert!(h.queue.drain().is_empty());
    assert_eq!(h.status(&id).await, InstanceStatus::Failed);
}

#[tokio::test]
async fn test_fanout_branches_complete_exactly_once() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "fanout",
        vec![
            script_node("split", "1", None),
            script_node("left", "2", None),
            script_node("right", "3", None),
        ],
        vec![("split", "left", None), ("split", "right", None)],
    ))
    .await;

    let id = h.start("fanout", json!({})).await;
    // The second branch waits in the queue; the instance must not
    // complete until it has run
    assert_eq!(h.status(&id).await, InstanceStatus::Running);

    h.pump().await;
    assert_eq!(h.status(&id).await, InstanceStatus::Completed);
    let steps = h.engine.get_steps(&id).await.unwrap();
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
}

#[tokio::test]
async fn test_cancelled_instance_ignores_late_callbacks() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "slow",
        vec![node(
            "wait_long",
            NodeType::Timer,
            json!({"timer_type": "delay", "delay_seconds": 3600}),
        )],
        vec![],
    ))
    .await;

    let id = h.start("slow", json!({})).await;
    assert_eq!(h.status(&id).await, InstanceStatus::Running);
    assert!(h
        .engine
        .cancel_process(&id, Some("operator request".to_string()))
        .await
        .unwrap());

    // The timer callback is still in the queue; delivering it is a no-op
    h.pump().await;
    let instance = h.engine.get_instance(&id).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Cancelled);
    assert_eq!(instance.status_reason.as_deref(), Some("operator request"));
    let steps = h.engine.get_steps(&id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Waiting);
}

#[tokio::test]
async fn test_skip_step_strategy_continues_past_failure() {
    let h = harness(StaticUserDirectory::new());
    h.deploy(definition(
        "tolerant",
        vec![
            node(
                "broken",
                NodeType::Gateway,
                json!({"conditions": [], "error_strategy": "skip_step"}),
            ),
            script_node("after", "'recovered'", Some("note")),
        ],
        vec![("broken", "after", None)],
    ))
    .await;

    let id = h.start("tolerant", json!({})).await;
    h.pump().await;

    assert_eq!(h.status(&id).await, InstanceStatus::Completed);
    let steps = h.engine.get_steps(&id).await.unwrap();
    let broken = steps.iter().find(|s| s.node_id.0 == "broken").unwrap();
    assert_eq!(broken.status, StepStatus::Failed);
    let after = steps.iter().find(|s| s.node_id.0 == "after").unwrap();
    assert_eq!(after.status, StepStatus::Completed);
}

#[tokio::test]
async fn test_starting_an_inactive_definition_is_rejected() {
    let h = harness(StaticUserDirectory::new());
    let mut def = definition("draft", vec![script_node("only", "1", None)], vec![]);
    def.status = DefinitionStatus::Draft;
    h.deploy(def).await;

    let result = h
        .engine
        .start_process(
            &ProcessDefinitionId("draft".to_string()),
            DataPacket::null(),
            None,
            Priority::Normal,
        )
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}
