use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use agentsync_protocol::{Event, FrameDecoder, Framing, ProtocolVersion};
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::adapter::{
    AgentAdapter, AgentInput, AgentKind, AgentOutput, AgentStream, InterruptRequest,
};
use crate::errors::AdapterError;

/// CUSTOM event name a remote agent uses to request a checkpoint pause.
pub const INTERRUPT_EVENT: &str = "on_interrupt";

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, AdapterError>> + Send + 'static>>;
pub type ConnectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ByteStream, AdapterError>> + Send + 'a>>;

/// Opens the byte stream of a remote agent for one step (HTTP POST,
/// socket, child process, ...). Transport failures map to `AdapterError`.
pub trait AgentTransport: Send + Sync + 'static {
    fn connect<'a>(&'a self, input: &'a AgentInput) -> ConnectFuture<'a>;
}

/// Adapter for agents that speak the event protocol over NDJSON or SSE.
#[derive(Clone)]
pub struct RemoteAgentAdapter {
    transport: Arc<dyn AgentTransport>,
    framing: Framing,
    version: ProtocolVersion,
}

impl RemoteAgentAdapter {
    pub fn new(transport: Arc<dyn AgentTransport>, framing: Framing) -> Self {
        Self {
            transport,
            framing,
            version: ProtocolVersion::CURRENT,
        }
    }

    /// Declare the event contract version the remote side speaks.
    pub fn with_contract_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }
}

struct RemoteStep {
    transport: Arc<dyn AgentTransport>,
    input: AgentInput,
    bytes: Option<ByteStream>,
    decoder: FrameDecoder,
    ready: VecDeque<Result<AgentOutput, AdapterError>>,
    done: bool,
}

impl RemoteStep {
    fn queue(&mut self, events: Vec<Event>) {
        for event in events {
            if self.done {
                return;
            }
            let output = into_output(event);
            if matches!(output, Err(_) | Ok(AgentOutput::Interrupt(_))) {
                self.done = true;
            }
            self.ready.push_back(output);
        }
    }
}

impl AgentAdapter for RemoteAgentAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Remote
    }

    fn contract_version(&self) -> ProtocolVersion {
        self.version
    }

    fn run(&self, input: AgentInput) -> AgentStream {
        let step = RemoteStep {
            transport: Arc::clone(&self.transport),
            input,
            bytes: None,
            decoder: FrameDecoder::new(self.framing),
            ready: VecDeque::new(),
            done: false,
        };
        Box::pin(futures::stream::unfold(step, |mut step| async move {
            loop {
                if let Some(item) = step.ready.pop_front() {
                    return Some((item, step));
                }
                if step.done {
                    return None;
                }
                if step.bytes.is_none() {
                    match step.transport.connect(&step.input).await {
                        Ok(bytes) => step.bytes = Some(bytes),
                        Err(err) => {
                            step.done = true;
                            return Some((Err(err), step));
                        }
                    }
                }
                let next = match step.bytes.as_mut() {
                    Some(bytes) => bytes.next().await,
                    None => None,
                };
                match next {
                    Some(Ok(chunk)) => match step.decoder.push(&chunk) {
                        Ok(events) => step.queue(events),
                        Err(err) => {
                            step.done = true;
                            step.ready.push_back(Err(err.into()));
                        }
                    },
                    Some(Err(err)) => {
                        step.done = true;
                        step.ready.push_back(Err(err));
                    }
                    None => {
                        match step.decoder.finish() {
                            Ok(events) => step.queue(events),
                            Err(err) => step.ready.push_back(Err(err.into())),
                        }
                        step.done = true;
                    }
                }
            }
        }))
    }
}

fn into_output(event: Event) -> Result<AgentOutput, AdapterError> {
    match event {
        Event::RunError { message, code } => Err(AdapterError::Remote { message, code }),
        Event::Custom { name, value } if name == INTERRUPT_EVENT => {
            parse_interrupt(value).map(AgentOutput::Interrupt)
        }
        other => Ok(AgentOutput::Event(other)),
    }
}

fn parse_interrupt(value: Value) -> Result<InterruptRequest, AdapterError> {
    serde_json::from_value(value)
        .map_err(|err| AdapterError::Codec(format!("invalid {INTERRUPT_EVENT} payload: {err}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use agentsync_protocol::{encode_line, encode_sse, Role};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    struct ChunkTransport {
        chunks: Vec<Result<Vec<u8>, AdapterError>>,
        seen_runs: Mutex<Vec<String>>,
    }

    impl AgentTransport for ChunkTransport {
        fn connect<'a>(&'a self, input: &'a AgentInput) -> ConnectFuture<'a> {
            Box::pin(async move {
                self.seen_runs
                    .lock()
                    .expect("lock")
                    .push(input.run_id.clone());
                let chunks = self.chunks.clone();
                Ok(Box::pin(futures::stream::iter(chunks)) as ByteStream)
            })
        }
    }

    fn input() -> AgentInput {
        AgentInput {
            thread_id: "t1".to_owned(),
            run_id: "run_1".to_owned(),
            agent: "remote".to_owned(),
            step: 0,
            messages: Vec::new(),
            context: Vec::new(),
            tools: Vec::new(),
            state: Value::Null,
            resume: None,
        }
    }

    fn split_in_two(text: &str) -> Vec<Result<Vec<u8>, AdapterError>> {
        let bytes = text.as_bytes();
        let middle = bytes.len() / 2;
        vec![Ok(bytes[..middle].to_vec()), Ok(bytes[middle..].to_vec())]
    }

    async fn collect(adapter: &RemoteAgentAdapter) -> Vec<Result<AgentOutput, AdapterError>> {
        adapter.run(input()).collect().await
    }

    #[tokio::test(flavor = "current_thread")]
    async fn decodes_sse_stream_across_chunk_boundaries() {
        let events = [
            Event::TextMessageStart {
                message_id: "m1".to_owned(),
                role: Role::Assistant,
            },
            Event::TextMessageContent {
                message_id: "m1".to_owned(),
                delta: "Hi".to_owned(),
            },
            Event::TextMessageEnd {
                message_id: "m1".to_owned(),
            },
        ];
        let body: String = events
            .iter()
            .map(|event| encode_sse(event).expect("encode"))
            .collect();
        let transport = Arc::new(ChunkTransport {
            chunks: split_in_two(&body),
            seen_runs: Mutex::new(Vec::new()),
        });
        let adapter = RemoteAgentAdapter::new(transport.clone(), Framing::Sse);

        let outputs = collect(&adapter).await;
        let expected: Vec<Result<AgentOutput, AdapterError>> = events
            .iter()
            .cloned()
            .map(|event| Ok(AgentOutput::Event(event)))
            .collect();
        assert_eq!(outputs, expected);
        assert_eq!(
            *transport.seen_runs.lock().expect("lock"),
            vec!["run_1".to_owned()]
        );
        assert_eq!(adapter.kind(), AgentKind::Remote);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn remote_run_error_and_interrupt_end_the_stream() {
        let body = [
            Event::custom(
                INTERRUPT_EVENT,
                json!({"nodeId": "approve", "value": {"question": "ok?"}}),
            ),
            Event::custom("ignored", json!(null)),
        ]
        .iter()
        .map(|event| encode_line(event).expect("encode"))
        .collect::<String>();
        let adapter = RemoteAgentAdapter::new(
            Arc::new(ChunkTransport {
                chunks: vec![Ok(body.into_bytes())],
                seen_runs: Mutex::new(Vec::new()),
            }),
            Framing::Ndjson,
        );
        let outputs = collect(&adapter).await;
        assert_eq!(
            outputs,
            vec![Ok(AgentOutput::Interrupt(InterruptRequest {
                node_id: "approve".to_owned(),
                value: json!({"question": "ok?"}),
                state: None,
            }))]
        );

        let body = encode_line(&Event::RunError {
            message: "boom".to_owned(),
            code: Some("E1".to_owned()),
        })
        .expect("encode");
        let adapter = RemoteAgentAdapter::new(
            Arc::new(ChunkTransport {
                chunks: vec![Ok(body.into_bytes())],
                seen_runs: Mutex::new(Vec::new()),
            }),
            Framing::Ndjson,
        );
        assert_eq!(
            collect(&adapter).await,
            vec![Err(AdapterError::Remote {
                message: "boom".to_owned(),
                code: Some("E1".to_owned()),
            })]
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn transport_and_decode_failures_surface_as_adapter_errors() {
        let adapter = RemoteAgentAdapter::new(
            Arc::new(ChunkTransport {
                chunks: vec![
                    Ok(b"{\"type\":\"STEP_STARTED\",\"stepName\":\"a\"}\n".to_vec()),
                    Err(AdapterError::Network("reset by peer".to_owned())),
                    Ok(b"never read\n".to_vec()),
                ],
                seen_runs: Mutex::new(Vec::new()),
            }),
            Framing::Ndjson,
        );
        let outputs = collect(&adapter).await;
        assert_eq!(outputs.len(), 2);
        assert_eq!(
            outputs[1],
            Err(AdapterError::Network("reset by peer".to_owned()))
        );

        let adapter = RemoteAgentAdapter::new(
            Arc::new(ChunkTransport {
                chunks: vec![Ok(b"not json\n".to_vec())],
                seen_runs: Mutex::new(Vec::new()),
            }),
            Framing::Ndjson,
        );
        assert!(matches!(
            collect(&adapter).await.as_slice(),
            [Err(AdapterError::Codec(_))]
        ));
    }
}
