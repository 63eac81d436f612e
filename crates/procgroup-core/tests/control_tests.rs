//! Driving a running group through the control channel.

use std::sync::Arc;

use procgroup_core::{
    local_group, shared, ControllerApp, IpcClient, ObjectInterpreter, ProcessError,
    ProcessModule, Transport,
};
use serde_json::json;
use tokio::sync::oneshot;

#[tokio::test]
async fn test_control_channel_session() {
    let mut group = local_group(3).into_iter();
    let controller_transport = Arc::new(group.next().unwrap());

    let workers: Vec<_> = group
        .map(|transport| {
            tokio::spawn(async move {
                let mut module =
                    ProcessModule::with_transport(Arc::new(transport), shared(ObjectInterpreter::new()));
                module.run(&mut ControllerApp::new(), true).await
            })
        })
        .collect();

    let (ready_tx, ready_rx) = oneshot::channel();
    let controller = {
        let transport = controller_transport.clone();
        tokio::spawn(async move {
            let mut module = ProcessModule::with_transport(transport, shared(ObjectInterpreter::new()));
            let mut app = ControllerApp::new().with_ready_signal(ready_tx);
            module.run(&mut app, true).await
        })
    };

    let addr = ready_rx.await.unwrap();
    let client = IpcClient::connect(addr).await.unwrap();

    let status = client.call("status", json!({})).await.unwrap();
    assert_eq!(status["partition_count"], 3);
    assert_eq!(status["partition_id"], 0);

    let dispatched = client
        .call(
            "dispatch",
            json!({
                "destination": "render_server_client_and_server",
                "commands": [
                    {"op": "new", "class": "PointCloud", "id": 5},
                    {"op": "invoke", "id": 5, "method": "AddPoint", "args": [
                        {"type": "float", "value": -1.0},
                        {"type": "float", "value": 0.0},
                        {"type": "float", "value": 4.0}
                    ]}
                ]
            }),
        )
        .await
        .unwrap();
    assert_eq!(dispatched, json!({"executed": 2}));

    let gathered = client
        .call("gather", json!({"kind": "DataInformation", "object": 5}))
        .await
        .unwrap();
    assert_eq!(gathered["number_of_points"], 3);
    assert_eq!(gathered["number_of_partitions"], 3);
    assert_eq!(gathered["bounds"], json!([-1.0, -1.0, 0.0, 0.0, 4.0, 4.0]));

    let class = client
        .call("gather", json!({"kind": "ClassNameInformation", "object": 5}))
        .await
        .unwrap();
    assert_eq!(class["class_name"], "PointCloud");

    let missing = client
        .call("gather", json!({"kind": "DataInformation", "object": 6}))
        .await;
    assert!(matches!(missing, Err(ProcessError::Rpc { code: -32002, .. })));

    let unknown = client
        .call("gather", json!({"kind": "NoSuchInformation", "object": 5}))
        .await;
    assert!(matches!(unknown, Err(ProcessError::Rpc { code: -32001, .. })));

    let loaded = client
        .call("load_module", json!({"name": "Nowhere"}))
        .await
        .unwrap();
    assert_eq!(loaded, json!({"loaded": false}));

    let bad = client.call("dispatch", json!({"destination": "moon"})).await;
    assert!(matches!(bad, Err(ProcessError::Rpc { code: -32602, .. })));

    let exited = client.call("exit", json!({})).await.unwrap();
    assert_eq!(exited, json!({"exited": true}));

    assert_eq!(controller.await.unwrap().unwrap(), 0);
    for worker in workers {
        assert_eq!(worker.await.unwrap().unwrap(), 0);
    }
    // Per worker: one stream, two valid gathers, one load, one teardown
    assert_eq!(controller_transport.stats().remote_calls_sent, 2 * 5);
}
