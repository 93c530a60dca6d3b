#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use commands::{RunnerCommand, RunnerReply};
    use futures::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::{Framed, LinesCodec};

    use crate::judge;
    use crate::registry::RunnerRegistry;

    // ─── Helpers ───────────────────────────────────────────────────────

    async fn start_server() -> (SocketAddr, Arc<RunnerRegistry>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let registry = Arc::new(RunnerRegistry::new());
        tokio::spawn(judge::serve(listener, registry.clone()));
        (addr, registry)
    }

    /// Connect as a runner and answer the INFO handshake with `machine_name`.
    async fn connect_runner(
        addr: SocketAddr,
        machine_name: &str,
    ) -> Framed<TcpStream, LinesCodec> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, LinesCodec::new());

        let line = framed.next().await.unwrap().unwrap();
        let cmd: RunnerCommand = serde_json::from_str(&line).unwrap();
        assert_eq!(cmd, RunnerCommand::Info);

        let reply = serde_json::to_string(&RunnerReply::machine_name(machine_name)).unwrap();
        framed.send(reply).await.unwrap();
        framed
    }

    async fn eventually(mut cond: impl FnMut() -> bool, what: &str) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    // ─── Handshake & lifecycle ─────────────────────────────────────────

    #[tokio::test]
    async fn handshake_registers_runner_and_channel_works() {
        let (addr, registry) = start_server().await;
        let mut runner = connect_runner(addr, "m1").await;
        eventually(|| registry.is_connected("m1"), "runner m1 to register").await;

        // Keep answering commands on the runner side.
        tokio::spawn(async move {
            while let Some(Ok(line)) = runner.next().await {
                let cmd: RunnerCommand = serde_json::from_str(&line).unwrap();
                assert_eq!(cmd, RunnerCommand::Check);
                let reply = serde_json::to_string(&RunnerReply::ok()).unwrap();
                if runner.send(reply).await.is_err() {
                    break;
                }
            }
        });

        let channel = registry.get("m1").expect("channel registered");
        let reply = channel
            .send_command(RunnerCommand::Check, Some(Duration::from_secs(3)))
            .await
            .unwrap();
        assert_eq!(reply, RunnerReply::ok());
    }

    #[tokio::test]
    async fn disconnect_unregisters_runner() {
        let (addr, registry) = start_server().await;
        let runner = connect_runner(addr, "m1").await;
        eventually(|| registry.is_connected("m1"), "runner m1 to register").await;

        drop(runner);
        eventually(|| !registry.is_connected("m1"), "runner m1 to unregister").await;
    }

    #[tokio::test]
    async fn duplicate_machine_name_keeps_first_connection() {
        let (addr, registry) = start_server().await;
        let mut first = connect_runner(addr, "m1").await;
        eventually(|| registry.is_connected("m1"), "runner m1 to register").await;

        // The second runner claims the same name; the server drops it.
        let mut second = connect_runner(addr, "m1").await;
        let closed = tokio::time::timeout(Duration::from_secs(5), second.next())
            .await
            .expect("server should close the duplicate connection");
        assert!(closed.is_none(), "expected EOF on the duplicate connection");

        // First connection is still the authoritative channel.
        assert!(registry.is_connected("m1"));
        tokio::spawn(async move {
            while let Some(Ok(line)) = first.next().await {
                let cmd: RunnerCommand = serde_json::from_str(&line).unwrap();
                assert_eq!(cmd, RunnerCommand::Check);
                let reply = serde_json::to_string(&RunnerReply::ok()).unwrap();
                if first.send(reply).await.is_err() {
                    break;
                }
            }
        });
        let channel = registry.get("m1").unwrap();
        let reply = channel
            .send_command(RunnerCommand::Check, Some(Duration::from_secs(3)))
            .await
            .unwrap();
        assert_eq!(reply, RunnerReply::ok());
    }
}
