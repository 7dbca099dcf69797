use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use roundhouse::proxy::bind_listeners;
use roundhouse::reply::read_reply;
use roundhouse::utils::Logger;
use roundhouse::{ProxyConfig, SmtpProxy};

/// A server that greets, answers everything with 250 and leaves on QUIT.
async fn spawn_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut reader = BufReader::new(read);
                let _ = write.write_all(b"220 fake.test ESMTP\r\n").await;

                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) if line.eq_ignore_ascii_case("QUIT\r\n") => break,
                        Ok(_) => {
                            let _ = write.write_all(b"250 ok\r\n").await;
                        }
                    }
                }
            });
        }
    });

    addr
}

#[tokio::test]
async fn serves_clients_until_shutdown() {
    let backend = spawn_backend().await;
    let mut config = ProxyConfig::new(vec![backend.parse().unwrap()]);
    config.interfaces = vec!["127.0.0.1:0".parse().unwrap()];

    let listeners = bind_listeners(&config.interfaces).unwrap();
    let local_addr = listeners[0].local_addr().unwrap();

    let logger = Arc::new(Logger::new(None, false, 0).unwrap());
    let proxy = Arc::new(SmtpProxy::new(Arc::new(config), logger));
    let server = tokio::spawn(proxy.clone().run(listeners));

    for _ in 0..2 {
        let stream = TcpStream::connect(local_addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        assert_eq!(read_reply(&mut reader).await.unwrap().code, 220);
        write.write_all(b"HELO client.test\r\n").await.unwrap();
        let helo = read_reply(&mut reader).await.unwrap();
        assert_eq!(helo.text, "250 roundhouse.local Hello client.test\r\n");
        write.write_all(b"QUIT\r\n").await.unwrap();
        assert_eq!(read_reply(&mut reader).await.unwrap().code, 221);
    }

    proxy.shutdown();
    server.await.unwrap().unwrap();

    assert!(TcpStream::connect(local_addr).await.is_err());
}

#[tokio::test]
async fn shutdown_reaches_open_sessions() {
    let backend = spawn_backend().await;
    let mut config = ProxyConfig::new(vec![backend.parse().unwrap()]);
    config.interfaces = vec!["127.0.0.1:0".parse().unwrap()];

    let listeners = bind_listeners(&config.interfaces).unwrap();
    let local_addr = listeners[0].local_addr().unwrap();

    let logger = Arc::new(Logger::new(None, false, 0).unwrap());
    let proxy = Arc::new(SmtpProxy::new(Arc::new(config), logger));
    let server = tokio::spawn(proxy.clone().run(listeners));

    let stream = TcpStream::connect(local_addr).await.unwrap();
    let mut reader = BufReader::new(stream);
    assert_eq!(read_reply(&mut reader).await.unwrap().code, 220);

    proxy.shutdown();
    let reply = read_reply(&mut reader).await.unwrap();
    assert_eq!(reply.text, "421 service shutting down\r\n");

    server.await.unwrap().unwrap();
}

#[test]
fn binding_a_busy_port_fails() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();
    assert!(bind_listeners(&[addr]).is_err());
}
