//! End-to-end SDS behavior over a real gRPC connection.

use std::time::Duration;

use prost::Message as _;
use tokio_stream::wrappers::ReceiverStream;

use certlane_core::notification::{self, Notification};
use certlane_store::Certificates;
use certlane_xds::proto::envoy::extensions::transport_sockets::tls::v3::Secret;
use certlane_xds::proto::envoy::service::discovery::v3::DiscoveryRequest;
use certlane_xds::proto::envoy::service::secret::v3::secret_discovery_service_client::SecretDiscoveryServiceClient;
use certlane_xds::{SECRET_TYPE_URL, XdsServer};

fn self_signed_cert_pem(cn: &str) -> Vec<u8> {
    use openssl::asn1::Asn1Time;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::hash::MessageDigest;
    use openssl::nid::Nid;
    use openssl::pkey::PKey;
    use openssl::x509::{X509, X509NameBuilder};

    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();
    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(90).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    builder.build().to_pem().unwrap()
}

fn bundle(domain: &str) -> Certificates {
    Certificates {
        domain: domain.into(),
        cert_url: "cert_url".into(),
        cert_stable_url: "cert_stable_url".into(),
        private_key: b"test key".to_vec(),
        certificate: self_signed_cert_pem(domain),
        issuer_certificate: Vec::new(),
        csr: Vec::new(),
    }
}

fn subscribe_request() -> DiscoveryRequest {
    DiscoveryRequest {
        version_info: String::new(),
        node: None,
        resource_names: Vec::new(),
        type_url: SECRET_TYPE_URL.to_string(),
        response_nonce: String::new(),
    }
}

#[tokio::test]
async fn early_subscriber_sees_the_startup_snapshot() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (notify_tx, notify_rx) = notification::channel();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let server_task = tokio::spawn(XdsServer::new().run(listener, notify_rx, shutdown_rx));

    // Subscribe before anything has been published.
    let mut client = SecretDiscoveryServiceClient::connect(format!("http://{addr}"))
        .await
        .unwrap();
    let (request_tx, request_rx) = tokio::sync::mpsc::channel(4);
    request_tx.send(subscribe_request()).await.unwrap();
    let mut responses = client
        .stream_secrets(ReceiverStream::new(request_rx))
        .await
        .unwrap()
        .into_inner();

    // The startup fire publishes the persisted state.
    notify_tx.send_replace(Some(Notification {
        certificates: vec![bundle("example.com")],
    }));

    let response = tokio::time::timeout(Duration::from_secs(10), responses.message())
        .await
        .expect("timed out waiting for sds push")
        .unwrap()
        .expect("stream ended without a response");

    assert!(response.version_info.parse::<i64>().unwrap() > 0);
    assert_eq!(response.type_url, SECRET_TYPE_URL);
    assert_eq!(response.resources.len(), 1);
    let secret = Secret::decode(&response.resources[0].value[..]).unwrap();
    assert_eq!(secret.name, "example.com");

    shutdown_tx.send(true).unwrap();
    let _ = server_task.await;
}

#[tokio::test]
async fn version_changes_are_pushed_to_connected_streams() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (notify_tx, notify_rx) = notification::channel();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let server_task = tokio::spawn(XdsServer::new().run(listener, notify_rx, shutdown_rx));

    notify_tx.send_replace(Some(Notification {
        certificates: vec![bundle("example.com")],
    }));

    let mut client = SecretDiscoveryServiceClient::connect(format!("http://{addr}"))
        .await
        .unwrap();
    let (request_tx, request_rx) = tokio::sync::mpsc::channel(4);
    request_tx.send(subscribe_request()).await.unwrap();
    let mut responses = client
        .stream_secrets(ReceiverStream::new(request_rx))
        .await
        .unwrap()
        .into_inner();

    let first = tokio::time::timeout(Duration::from_secs(10), responses.message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.resources.len(), 1);

    // A renewal lands; the snapshot version moves and the stream re-pushes.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    notify_tx.send_replace(Some(Notification {
        certificates: vec![bundle("example.com"), bundle("other.example")],
    }));

    let second = tokio::time::timeout(Duration::from_secs(10), responses.message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(second.resources.len(), 2);
    assert!(
        second.version_info.parse::<i64>().unwrap() > first.version_info.parse::<i64>().unwrap()
    );

    shutdown_tx.send(true).unwrap();
    let _ = server_task.await;
}

#[tokio::test]
async fn fetch_is_unavailable_until_a_snapshot_exists() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (notify_tx, notify_rx) = notification::channel();
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let server_task = tokio::spawn(XdsServer::new().run(listener, notify_rx, shutdown_rx));

    let mut client = SecretDiscoveryServiceClient::connect(format!("http://{addr}"))
        .await
        .unwrap();

    let status = client
        .fetch_secrets(subscribe_request())
        .await
        .expect_err("fetch should fail before any snapshot");
    assert_eq!(status.code(), tonic::Code::Unavailable);

    notify_tx.send_replace(Some(Notification {
        certificates: vec![bundle("example.com")],
    }));

    // The pump applies the snapshot asynchronously; poll briefly.
    let mut fetched = None;
    for _ in 0..50 {
        match client.fetch_secrets(subscribe_request()).await {
            Ok(response) => {
                fetched = Some(response.into_inner());
                break;
            }
            Err(status) if status.code() == tonic::Code::Unavailable => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(status) => panic!("unexpected status: {status}"),
        }
    }
    let response = fetched.expect("snapshot never became fetchable");
    assert_eq!(response.resources.len(), 1);

    shutdown_tx.send(true).unwrap();
    let _ = server_task.await;
}
