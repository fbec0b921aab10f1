use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use modbus_client::{ClientConfig, ClientError, ModbusClient, MockWrite, TransportKind};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use types::RegisterKind;

fn fast_config() -> ClientConfig {
    ClientConfig {
        timeout_ms: 200,
        retry_count: 2,
        retry_backoff_ms: 5,
        retry_max_backoff_ms: 10,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn mock_reads_preloaded_registers_in_batches() {
    let mut config = fast_config();
    config.max_batch_size = Some(3);
    let client = ModbusClient::new_mock(config);
    client
        .mock_preload(1, RegisterKind::Holding, 100, &[1, 2, 3, 4, 5, 6, 7])
        .await;

    let values = client
        .read_range(1, RegisterKind::Holding, 100, 7)
        .await
        .expect("read");
    assert_eq!(values, vec![1, 2, 3, 4, 5, 6, 7]);

    let other_table = client
        .read_range(1, RegisterKind::Input, 100, 2)
        .await
        .expect("read");
    assert_eq!(other_table, vec![0, 0]);
}

#[tokio::test]
async fn mock_records_writes() {
    let client = ModbusClient::new_mock(fast_config());
    client.write_registers(3, 1_000, &[42]).await.expect("write");
    client
        .write_registers(3, 1_010, &[0x0001, 0x1170])
        .await
        .expect("write");

    assert_eq!(
        client.mock_writes().await,
        vec![
            MockWrite {
                unit_id: 3,
                offset: 1_000,
                words: vec![42],
            },
            MockWrite {
                unit_id: 3,
                offset: 1_010,
                words: vec![0x0001, 0x1170],
            },
        ]
    );
    let read_back = client
        .read_range(3, RegisterKind::Holding, 1_010, 2)
        .await
        .expect("read");
    assert_eq!(read_back, vec![0x0001, 0x1170]);
}

#[tokio::test]
async fn rejects_oversized_and_overflowing_writes() {
    let client = ModbusClient::new_mock(fast_config());
    assert!(matches!(
        client.write_registers(1, 0, &[0; 124]).await,
        Err(ClientError::TooManyRegisters(124))
    ));
    assert!(matches!(
        client.write_registers(1, u16::MAX, &[1, 2]).await,
        Err(ClientError::AddressOverflow)
    ));
    assert!(client.mock_writes().await.is_empty());
}

#[tokio::test]
async fn offline_device_fails_after_retries() {
    let client = ModbusClient::new_mock(fast_config());
    client.mock_set_offline(true).await;

    let started = Instant::now();
    let result = client.write_registers(1, 0, &[1]).await;
    assert!(matches!(result, Err(ClientError::Io(_))));
    // Two retries with 5ms and 10ms backoff.
    assert!(started.elapsed().as_millis() >= 15);
    assert!(client.mock_writes().await.is_empty());
}

#[tokio::test]
async fn rtu_gateway_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let gateway = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");

        let mut request = [0u8; 8];
        socket.read_exact(&mut request).await.expect("read request");
        assert_eq!(hex(&request), "0203000a0002e43a");
        socket
            .write_all(&unhex("02030412345678b207"))
            .await
            .expect("reply");

        socket.read_exact(&mut request).await.expect("read request");
        assert_eq!(hex(&request), "020600050007d83a");
        socket.write_all(&request).await.expect("echo");

        socket.read_exact(&mut request).await.expect("read request");
        socket
            .write_all(&unhex("028603f261"))
            .await
            .expect("exception");
    });

    let mut config = fast_config();
    config.host = addr.ip().to_string();
    config.port = addr.port();
    config.transport = TransportKind::RtuOverTcp;
    let client = ModbusClient::connect(config).await.expect("connect");

    let values = client
        .read_range(2, RegisterKind::Holding, 10, 2)
        .await
        .expect("read");
    assert_eq!(values, vec![0x1234, 0x5678]);

    client.write_registers(2, 5, &[7]).await.expect("write");

    let rejected = client.write_registers(2, 5, &[8]).await;
    assert!(matches!(
        rejected,
        Err(ClientError::Exception {
            function: 0x86,
            code: 3,
            ..
        })
    ));

    gateway.await.expect("gateway task");
}

#[tokio::test]
async fn rtu_gateway_rejects_mismatched_write_echo() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    // Every bad reply drops the link, so each exchange arrives on a fresh connection.
    let exchanges = [
        ("020600050007d83a", "020600060009a9fe"),
        ("021000050002040007000800d2a5", "020600050007d83a"),
        ("0203000a0002e43a", "02040412345678b3b0"),
        ("021000050002040007000800d2a5", "02100005000251fa"),
    ];
    let gateway = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        for (index, (expected, reply)) in exchanges.iter().enumerate() {
            if index > 0 {
                (socket, _) = listener.accept().await.expect("accept again");
            }
            let mut request = vec![0u8; expected.len() / 2];
            socket.read_exact(&mut request).await.expect("read request");
            assert_eq!(hex(&request), *expected);
            socket.write_all(&unhex(reply)).await.expect("reply");
        }
    });

    let mut config = fast_config();
    config.host = addr.ip().to_string();
    config.port = addr.port();
    config.transport = TransportKind::RtuOverTcp;
    config.retry_count = 0;
    let client = ModbusClient::new(config);

    let wrong_echo = client.write_registers(2, 5, &[7]).await;
    assert!(matches!(wrong_echo, Err(ClientError::UnexpectedResponse(_))));

    let wrong_function = client.write_registers(2, 5, &[7, 8]).await;
    assert!(matches!(
        wrong_function,
        Err(ClientError::UnexpectedResponse(_))
    ));

    let wrong_table = client.read_range(2, RegisterKind::Holding, 10, 2).await;
    assert!(matches!(wrong_table, Err(ClientError::UnexpectedResponse(_))));

    client
        .write_registers(2, 5, &[7, 8])
        .await
        .expect("matching echo");

    gateway.await.expect("gateway task");
}

#[tokio::test]
async fn tcp_device_exception_is_not_retried() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let seen = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&seen);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let mut header = [0u8; 7];
                while socket.read_exact(&mut header).await.is_ok() {
                    let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
                    let mut pdu = vec![0u8; length.saturating_sub(1)];
                    if socket.read_exact(&mut pdu).await.is_err() {
                        return;
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    // MBAP header echoed back with an illegal data address exception.
                    let reply = [
                        header[0],
                        header[1],
                        0,
                        0,
                        0,
                        3,
                        header[6],
                        pdu[0] | 0x80,
                        0x02,
                    ];
                    if socket.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    let mut config = fast_config();
    config.host = addr.ip().to_string();
    config.port = addr.port();
    config.transport = TransportKind::Tcp;
    let client = ModbusClient::new(config);

    let result = client.write_registers(1, 5, &[7]).await;
    assert!(matches!(
        result,
        Err(ClientError::Exception {
            function: 0x86,
            code: 2,
            ..
        })
    ));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn lazy_client_dials_on_first_request() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let mut config = fast_config();
    config.host = addr.ip().to_string();
    config.port = addr.port();
    config.transport = TransportKind::RtuOverTcp;
    config.retry_count = 1;

    // Building the client never touches the network.
    let client = ModbusClient::new(config);
    let result = client.read_range(1, RegisterKind::Holding, 0, 1).await;
    assert!(matches!(
        result,
        Err(ClientError::Io(_) | ClientError::Timeout { .. })
    ));
}

#[tokio::test]
async fn lazy_client_redials_after_dropped_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");

    let gateway = tokio::spawn(async move {
        // First connection hangs up without answering.
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut request = [0u8; 8];
        socket.read_exact(&mut request).await.expect("read request");
        drop(socket);

        let (mut socket, _) = listener.accept().await.expect("accept again");
        socket.read_exact(&mut request).await.expect("read request");
        assert_eq!(hex(&request), "020600050007d83a");
        socket.write_all(&request).await.expect("echo");
    });

    let mut config = fast_config();
    config.host = addr.ip().to_string();
    config.port = addr.port();
    config.transport = TransportKind::RtuOverTcp;
    let client = ModbusClient::new(config);

    client.write_registers(2, 5, &[7]).await.expect("write after redial");
    gateway.await.expect("gateway task");
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn unhex(value: &str) -> Vec<u8> {
    (0..value.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(&value[index..index + 2], 16).expect("hex digit"))
        .collect()
}
