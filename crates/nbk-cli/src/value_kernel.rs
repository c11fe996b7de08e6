//! In-memory value store kernel hosted by `nbk serve`.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use indexmap::IndexMap;
use nbk_kernel::{KernelInvocation, SimpleKernel, handler_fn};
use nbk_protocol::{CommandType, EventType};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const VALUE_PRODUCED: &str = EventType::VALUE_PRODUCED;
pub const VALUE_INFOS_PRODUCED: &str = EventType::VALUE_INFOS_PRODUCED;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormattedValue {
    pub mime_type: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendValue {
    name: String,
    formatted_value: FormattedValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestValue {
    name: String,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValueProduced<'a> {
    name: &'a str,
    formatted_value: &'a FormattedValue,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValueInfo<'a> {
    name: &'a str,
    formatted_value: &'a FormattedValue,
    type_name: &'static str,
}

type Store = Arc<Mutex<IndexMap<String, FormattedValue>>>;

pub fn create(name: &str) -> Arc<SimpleKernel> {
    let kernel = SimpleKernel::new(name);
    kernel.update_info(|info| {
        info.language_name = Some("Value".into());
        info.display_name = "Value Store".into();
        info.description = Some("Stores named values and hands them back on request".into());
    });

    let store: Store = Arc::default();

    let values = store.clone();
    kernel.register_command_handler(
        CommandType::SEND_VALUE,
        handler_fn(move |invocation: KernelInvocation| {
            let values = values.clone();
            async move {
                let SendValue {
                    name,
                    formatted_value,
                } = parse(&invocation)?;
                values
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(name, formatted_value);
                Ok(())
            }
        }),
    );

    let values = store.clone();
    kernel.register_command_handler(
        CommandType::REQUEST_VALUE,
        handler_fn(move |invocation: KernelInvocation| {
            let values = values.clone();
            async move {
                let request: RequestValue = parse(&invocation)?;
                let formatted_value = values
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&request.name)
                    .cloned()
                    .with_context(|| format!("Value '{}' not found", request.name))?;
                if let Some(mime_type) = &request.mime_type {
                    anyhow::ensure!(
                        *mime_type == formatted_value.mime_type,
                        "Value '{}' is not available as {mime_type}",
                        request.name
                    );
                }
                let produced = ValueProduced {
                    name: &request.name,
                    formatted_value: &formatted_value,
                };
                invocation.publish(VALUE_PRODUCED, serde_json::to_value(produced)?);
                Ok(())
            }
        }),
    );

    let values = store;
    kernel.register_command_handler(
        CommandType::REQUEST_VALUE_INFOS,
        handler_fn(move |invocation: KernelInvocation| {
            let values = values.clone();
            async move {
                let event = {
                    let values = values.lock().unwrap_or_else(PoisonError::into_inner);
                    let value_infos: Vec<ValueInfo<'_>> = values
                        .iter()
                        .map(|(name, formatted_value)| ValueInfo {
                            name,
                            formatted_value,
                            type_name: "string",
                        })
                        .collect();
                    serde_json::json!({ "valueInfos": value_infos })
                };
                invocation.publish(VALUE_INFOS_PRODUCED, event);
                Ok(())
            }
        }),
    );

    kernel
}

fn parse<T: DeserializeOwned>(invocation: &KernelInvocation) -> anyhow::Result<T> {
    let command = invocation.command_envelope.command();
    let kind = invocation.command_envelope.command_type().clone();
    serde_json::from_value(serde_json::Value::Object(command.fields))
        .with_context(|| format!("invalid {kind} command"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nbk_kernel::{Kernel, KernelExt};
    use nbk_protocol::{CommandFailed, KernelCommand, KernelCommandEnvelope, KernelEventEnvelope};

    fn record(kernel: &SimpleKernel) -> (Arc<Mutex<Vec<KernelEventEnvelope>>>, nbk_kernel::Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let subscription = kernel.subscribe_to_kernel_events(Arc::new(move |event| {
            log.lock().unwrap().push(event.clone());
        }));
        (seen, subscription)
    }

    #[tokio::test]
    async fn stored_values_can_be_requested() {
        let kernel = create("value");
        let (seen, _subscription) = record(&kernel);

        let send = KernelCommandEnvelope::new(
            CommandType::SEND_VALUE,
            KernelCommand::new()
                .with_field("name", "answer")
                .with_field(
                    "formattedValue",
                    serde_json::json!({ "mimeType": "text/plain", "value": "42" }),
                ),
        );
        kernel.send(send).await.unwrap();

        let request = KernelCommandEnvelope::new(
            CommandType::REQUEST_VALUE,
            KernelCommand::new().with_field("name", "answer"),
        );
        kernel.send(request).await.unwrap();

        let infos =
            KernelCommandEnvelope::new(CommandType::REQUEST_VALUE_INFOS, KernelCommand::new());
        kernel.send(infos).await.unwrap();

        let events = seen.lock().unwrap();
        let produced = events
            .iter()
            .find(|event| event.event_type().as_str() == VALUE_PRODUCED)
            .unwrap();
        assert_eq!(produced.event()["formattedValue"]["value"], "42");
        let listed = events
            .iter()
            .find(|event| event.event_type().as_str() == VALUE_INFOS_PRODUCED)
            .unwrap();
        assert_eq!(listed.event()["valueInfos"][0]["name"], "answer");
    }

    #[tokio::test]
    async fn missing_values_fail_the_command() {
        let kernel = create("value");
        let (seen, _subscription) = record(&kernel);
        let request = KernelCommandEnvelope::new(
            CommandType::REQUEST_VALUE,
            KernelCommand::new().with_field("name", "nope"),
        );
        kernel.send(request).await.unwrap();

        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].payload::<CommandFailed>().unwrap().message,
            "Value 'nope' not found"
        );
    }
}
