use std::sync::Arc;

use nbk_kernel::transport::{KernelEnvelopeSender, mem};
use nbk_kernel::{CompositeKernel, HostConfig, Kernel, KernelHost};
use nbk_protocol::{
    CommandType, EventType, KernelCommand, KernelCommandEnvelope, KernelInfo, KernelInfoProduced,
    KernelReady,
};

#[path = "helpers.rs"]
mod helpers;
use helpers::{Inbox, submit_code_kernel};

fn host_with_client() -> (Arc<KernelHost>, mem::MemSender, Inbox) {
    let ((host_tx, host_rx), (client_tx, client_rx)) = mem::pair();
    let inbox = Inbox::attach(&client_rx);

    let root = CompositeKernel::new("root");
    root.add(submit_code_kernel("javascript"), &["js"]).unwrap();
    let config = HostConfig {
        uri: "kernel://vscode".into(),
        ..HostConfig::default()
    };
    let host = KernelHost::new(root, Arc::new(host_tx), Arc::new(host_rx), config);
    (host, client_tx, inbox)
}

#[tokio::test]
async fn connect_announces_kernel_ready() {
    let (host, _client_tx, mut inbox) = host_with_client();
    assert_eq!(host.uri(), "kernel://vscode");
    assert_eq!(
        host.kernel().find_kernel_by_name("js").unwrap().uri(),
        "kernel://vscode/javascript"
    );

    let ready = host.connect().unwrap();
    let names: Vec<_> = ready
        .kernel_infos
        .iter()
        .map(|info| info.local_name.clone())
        .collect();
    assert_eq!(names, vec!["root", "javascript"]);

    let event = inbox.next_event(EventType::KERNEL_READY).await;
    assert_eq!(event.routing_slip().to_vec(), vec!["kernel://vscode/"]);
    assert_eq!(event.payload::<KernelReady>().unwrap(), ready);
    host.shutdown().await;
}

#[tokio::test]
async fn inbound_commands_are_routed_and_answered() {
    let (host, client_tx, mut inbox) = host_with_client();
    host.connect().unwrap();

    let command = KernelCommandEnvelope::new(
        CommandType::SUBMIT_CODE,
        KernelCommand::targeting("js").with_field("code", "40 + 2"),
    );
    let token = command.get_or_create_token();
    client_tx.send(command.into()).await.unwrap();

    let received = inbox.next_event(EventType::CODE_SUBMISSION_RECEIVED).await;
    assert_eq!(received.command().unwrap().token().unwrap(), token);
    assert_eq!(
        received.routing_slip().to_vec(),
        vec!["kernel://vscode/javascript", "kernel://vscode/"]
    );

    let succeeded = inbox.next_event(EventType::COMMAND_SUCCEEDED).await;
    let answered = succeeded.command().unwrap();
    assert_eq!(answered.token().unwrap(), token);
    assert!(answered.routing_slip().contains("kernel://vscode/javascript", false));
    host.shutdown().await;
}

#[tokio::test]
async fn proxies_need_a_connector_that_reaches_the_remote_host() {
    let ((host_tx, host_rx), (client_tx, _client_rx)) = mem::pair();
    let host = KernelHost::new(
        CompositeKernel::new("root"),
        Arc::new(host_tx),
        Arc::new(host_rx),
        HostConfig::default(),
    );

    let err = host
        .connect_proxy_kernel("python", "kernel://jupyter/python", &[])
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Cannot find connector to reach kernel://jupyter/python"
    );

    let remote_info = KernelInfo::new("python", "kernel://jupyter/python");
    let announcement = nbk_protocol::KernelEventEnvelope::from_payload(
        &KernelInfoProduced {
            kernel_info: remote_info,
        },
        None,
    );
    client_tx.send(announcement.into()).await.unwrap();

    let proxy = host
        .connect_proxy_kernel("python", "kernel://jupyter/python", &["py"])
        .unwrap();
    assert!(proxy.kernel_info().is_proxy);
    assert_eq!(proxy.uri(), "kernel://local/python");
    assert_eq!(host.kernel().find_kernel_by_name("py").unwrap().name(), "python");
    assert!(host.try_get_connector("kernel://jupyter/other").is_some());
}

#[tokio::test]
async fn get_kernel_falls_back_to_the_root() {
    let (host, _client_tx, _inbox) = host_with_client();

    let by_destination = KernelCommandEnvelope::new(
        CommandType::SUBMIT_CODE,
        KernelCommand::new().with_destination_uri("kernel://vscode/javascript"),
    );
    assert_eq!(host.get_kernel(&by_destination).name(), "javascript");

    let by_name =
        KernelCommandEnvelope::new(CommandType::SUBMIT_CODE, KernelCommand::targeting("js"));
    assert_eq!(host.get_kernel(&by_name).name(), "javascript");

    let unknown = KernelCommandEnvelope::new(
        CommandType::SUBMIT_CODE,
        KernelCommand::targeting("nonexistent").with_origin_uri("kernel://elsewhere/x"),
    );
    assert_eq!(host.get_kernel(&unknown).name(), "root");
}
