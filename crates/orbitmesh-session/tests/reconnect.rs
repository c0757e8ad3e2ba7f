//! Session-layer integration: dispatch over real TCP, disconnect, resume
//! reconciliation, and at-least-once terminal folding.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orbitmesh_core::engine::{EngineConfig, WorkflowEngine};
use orbitmesh_core::notify::{Notifier, NotifyError};
use orbitmesh_core::registry::DefinitionRegistry;
use orbitmesh_infra::memory::MemoryStore;
use orbitmesh_session::auth::TokenAuthenticator;
use orbitmesh_session::client::{AgentClient, AssignedJob, JobHandler};
use orbitmesh_session::codec::FrameCodec;
use orbitmesh_session::dispatch::SessionDispatcher;
use orbitmesh_session::frame::{Frame, FrameBody, PROTOCOL_VERSION};
use orbitmesh_session::server::{SessionManager, SessionServer, SessionServerConfig};
use orbitmesh_types::config::AgentConfig;
use orbitmesh_types::instance::InstanceStatus;
use orbitmesh_types::job::{AgentSelector, JobStatus};
use orbitmesh_types::workflow::{StepConfig, StepType, WorkflowDefinition, WorkflowStep};

struct NoopNotifier;

impl Notifier for NoopNotifier {
    async fn notify(&self, _target: &str, _message: &str) -> Result<(), NotifyError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stack harness
// ---------------------------------------------------------------------------

struct Stack {
    store: Arc<MemoryStore>,
    engine: WorkflowEngine<MemoryStore, SessionDispatcher<MemoryStore>, NoopNotifier>,
    registry: DefinitionRegistry<MemoryStore>,
    auth: Arc<TokenAuthenticator>,
    addr: std::net::SocketAddr,
}

async fn stack() -> Stack {
    let store = Arc::new(MemoryStore::new());
    let sessions = Arc::new(SessionManager::default());
    let dispatcher = Arc::new(SessionDispatcher::new(Arc::clone(&store), Arc::clone(&sessions)));
    let engine = WorkflowEngine::new(
        Arc::clone(&store),
        dispatcher,
        Arc::new(NoopNotifier),
        EngineConfig::default(),
    );
    let auth = Arc::new(TokenAuthenticator::new());
    let server = Arc::new(SessionServer::new(
        Arc::clone(&store),
        Arc::clone(&auth),
        engine.result_sink(),
        sessions,
        SessionServerConfig::default(),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(server.serve(listener));

    let registry = DefinitionRegistry::new(Arc::clone(&store));
    Stack {
        store,
        engine,
        registry,
        auth,
        addr,
    }
}

fn job_workflow(id: &str) -> WorkflowDefinition {
    WorkflowDefinition {
        id: id.to_string(),
        version: 1,
        name: id.to_string(),
        description: None,
        input_schema: None,
        steps: vec![WorkflowStep {
            id: "work".to_string(),
            name: "work".to_string(),
            step_type: StepType::Job,
            config: StepConfig::Job {
                selector: AgentSelector::default(),
                payload: json!({"task": id}),
            },
            depends_on: vec![],
            condition: None,
            timeout_secs: None,
            max_retries: 0,
            retry_delay_secs: None,
            continue_on_error: false,
            compensation: None,
            output_variable: Some(format!("{}_out", id.replace('-', "_"))),
        }],
    }
}

// ---------------------------------------------------------------------------
// Raw protocol peer (full control over frames)
// ---------------------------------------------------------------------------

struct RawAgent {
    framed: Framed<TcpStream, FrameCodec>,
    seq: u64,
}

impl RawAgent {
    async fn connect(addr: std::net::SocketAddr, token: &str, agent_id: Uuid) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let mut agent = Self {
            framed: Framed::new(stream, FrameCodec::new()),
            seq: 0,
        };
        agent
            .send(FrameBody::Hello {
                agent_id: Some(agent_id),
                name: "raw-agent".to_string(),
                tags: vec![],
                capabilities: vec![],
                access_token: Some(token.to_string()),
                bootstrap_token: None,
                protocol_version: PROTOCOL_VERSION,
            })
            .await;
        let ack = agent.recv().await;
        assert!(
            matches!(ack, FrameBody::HelloAck { .. }),
            "expected HelloAck, got {ack:?}"
        );
        agent
    }

    async fn send(&mut self, body: FrameBody) {
        let frame = Frame {
            seq: self.seq,
            body,
        };
        self.seq += 1;
        self.framed.send(frame).await.expect("send frame");
    }

    async fn recv(&mut self) -> FrameBody {
        tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("frame within deadline")
            .expect("stream open")
            .expect("clean frame")
            .body
    }
}

// ---------------------------------------------------------------------------
// Scenario 6: reconnect reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnect_reconciliation_with_duplicate_terminal() {
    let stack = stack().await;
    let agent_id = Uuid::now_v7();
    stack.auth.register_access_token("tok-raw", agent_id);

    stack.registry.register(job_workflow("wf-one")).await.unwrap();
    stack.registry.register(job_workflow("wf-two")).await.unwrap();

    // First connection: receive both assignments and ack them.
    let mut agent = RawAgent::connect(stack.addr, "tok-raw", agent_id).await;

    let instance_one = stack
        .engine
        .start("wf-one", None, IndexMap::new())
        .await
        .unwrap();
    let instance_two = stack
        .engine
        .start("wf-two", None, IndexMap::new())
        .await
        .unwrap();

    let mut j1 = None;
    let mut j2 = None;
    for _ in 0..2 {
        match agent.recv().await {
            FrameBody::JobAssigned {
                job_id,
                instance_id,
                ..
            } => {
                if instance_id == instance_one {
                    j1 = Some(job_id);
                } else if instance_id == instance_two {
                    j2 = Some(job_id);
                }
            }
            other => panic!("expected assignment, got {other:?}"),
        }
    }
    let (j1, j2) = (j1.expect("j1 assigned"), j2.expect("j2 assigned"));
    agent.send(FrameBody::JobAck { job_id: j1 }).await;
    agent.send(FrameBody::JobAck { job_id: j2 }).await;

    // Let the acks land, then drop the connection mid-run.
    tokio::time::sleep(Duration::from_millis(100)).await;
    use orbitmesh_core::store::JobStore;
    assert_eq!(
        stack.store.get_job(j1).await.unwrap().unwrap().status,
        JobStatus::Running
    );
    drop(agent);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Reconnect. Resume lists j1 plus a job the server never issued, and
    // forgets j2 entirely.
    let ghost = Uuid::now_v7();
    let mut agent = RawAgent::connect(stack.addr, "tok-raw", agent_id).await;
    agent
        .send(FrameBody::Resume {
            job_ids: vec![j1, ghost],
        })
        .await;

    // Reconciliation: the ghost is cancelled, j2 is reassigned, j1 is
    // acknowledged silently.
    let mut ghost_cancelled = false;
    let mut j2_reassigned = false;
    for _ in 0..2 {
        match agent.recv().await {
            FrameBody::CancelJob { job_id } => {
                assert_eq!(job_id, ghost);
                ghost_cancelled = true;
            }
            FrameBody::JobAssigned { job_id, .. } => {
                assert_eq!(job_id, j2);
                j2_reassigned = true;
            }
            other => panic!("unexpected reconciliation frame: {other:?}"),
        }
    }
    assert!(ghost_cancelled && j2_reassigned);

    // j2 stayed Running across the disconnect.
    assert_eq!(
        stack.store.get_job(j2).await.unwrap().unwrap().status,
        JobStatus::Running
    );

    // j1 finished locally while disconnected: deliver its terminal, then a
    // conflicting duplicate.
    agent
        .send(FrameBody::JobSucceeded {
            job_id: j1,
            output: json!({"n": 4}),
        })
        .await;
    agent
        .send(FrameBody::JobSucceeded {
            job_id: j1,
            output: json!({"n": 999}),
        })
        .await;
    agent
        .send(FrameBody::JobSucceeded {
            job_id: j2,
            output: json!("two done"),
        })
        .await;

    let status = stack
        .engine
        .await_terminal(instance_one, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Completed);
    let status = stack
        .engine
        .await_terminal(instance_two, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Completed);

    // First terminal won: the duplicate's output never surfaced.
    let one = stack.engine.get_instance(instance_one).await.unwrap();
    assert_eq!(one.variables.get("wf_one_out"), Some(&json!({"n": 4})));
    let job_row = stack.store.get_job(j1).await.unwrap().unwrap();
    assert_eq!(job_row.status, JobStatus::Succeeded);
    assert_eq!(job_row.result, Some(json!({"n": 4})));
}

// ---------------------------------------------------------------------------
// Full stack with the real agent client
// ---------------------------------------------------------------------------

/// Handler that answers `{"task": ...}` payloads.
struct EchoHandler;

impl JobHandler for EchoHandler {
    async fn execute(&self, job: AssignedJob, _cancel: CancellationToken) -> Result<Value, String> {
        let task = job
            .payload
            .get("task")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        Ok(json!({"done": task}))
    }
}

#[tokio::test]
async fn agent_client_bootstraps_and_executes_jobs() {
    let stack = stack().await;
    stack.auth.add_bootstrap_token("enroll-1");

    let config = AgentConfig {
        server_url: stack.addr.to_string(),
        agent_name: "worker-7".to_string(),
        bootstrap_token: Some("enroll-1".to_string()),
        heartbeat_interval_secs: 1,
        ..AgentConfig::default()
    };
    let shutdown = CancellationToken::new();
    let client = AgentClient::new(config, Arc::new(EchoHandler));
    let client_task = tokio::spawn(client.run(shutdown.clone()));

    // Wait until the agent is enrolled and online.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        use orbitmesh_core::store::AgentStore;
        let agents = stack.store.list_agents().await.unwrap();
        if agents
            .iter()
            .any(|a| a.name == "worker-7" && a.session_state.accepts_work())
        {
            assert!(
                agents[0]
                    .credential_fingerprint
                    .as_deref()
                    .is_some_and(|fp| fp.starts_with("sha256:")),
                "bootstrap exchange stored a fingerprint"
            );
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "agent never came online"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    stack.registry.register(job_workflow("wf-echo")).await.unwrap();
    let instance_id = stack
        .engine
        .start("wf-echo", None, IndexMap::new())
        .await
        .unwrap();

    let status = stack
        .engine
        .await_terminal(instance_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(status, InstanceStatus::Completed);

    let instance = stack.engine.get_instance(instance_id).await.unwrap();
    assert_eq!(
        instance.variables.get("wf_echo_out"),
        Some(&json!({"done": "wf-echo"}))
    );

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), client_task).await;
}
