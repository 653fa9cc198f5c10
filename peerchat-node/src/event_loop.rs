//! Single-threaded event loop: one input line or one transport event per
//! iteration, then every action it produced, before waiting again.

use std::collections::VecDeque;
use std::future::Future;
use std::io::Write;

use peerchat_core::{Action, ChannelHandle, Command, PeerChatCore};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::transport::{Transport, TransportEvent};

enum Input {
    Line(std::io::Result<Option<String>>),
    Event(crate::transport::Result<TransportEvent>),
    Interrupt,
}

pub struct EventLoop<T, W> {
    core: PeerChatCore,
    transport: T,
    out: W,
}

impl<T: Transport, W: Write> EventLoop<T, W> {
    pub fn new(core: PeerChatCore, transport: T, out: W) -> Self {
        Self {
            core,
            transport,
            out,
        }
    }

    /// Run until `/exit`, end of input, or `shutdown` resolves.
    pub async fn run<R, S>(&mut self, input: R, shutdown: S) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        S: Future<Output = ()>,
    {
        let mut lines = input.lines();
        tokio::pin!(shutdown);
        let mut interrupted = false;
        loop {
            let next = tokio::select! {
                line = lines.next_line() => Input::Line(line),
                event = self.transport.next_event() => Input::Event(event),
                _ = &mut shutdown, if !interrupted => Input::Interrupt,
            };
            let actions = match next {
                Input::Line(Ok(Some(line))) => self.on_line(&line)?,
                Input::Line(Ok(None)) => {
                    info!("input closed");
                    self.core.on_command(Command::Exit)
                }
                Input::Line(Err(e)) => {
                    warn!("cannot read input: {e}");
                    self.core.on_command(Command::Exit)
                }
                Input::Event(Ok(event)) => self.on_event(event),
                Input::Event(Err(e)) => {
                    warn!("transport: {e}");
                    Vec::new()
                }
                Input::Interrupt => {
                    interrupted = true;
                    info!("interrupted");
                    self.core.on_command(Command::Exit)
                }
            };
            if self.perform(actions).await? {
                return Ok(());
            }
        }
    }

    fn on_line(&mut self, line: &str) -> std::io::Result<Vec<Action>> {
        match Command::parse(line) {
            Ok(Some(command)) => Ok(self.core.on_command(command)),
            Ok(None) => Ok(Vec::new()),
            Err(hint) => {
                writeln!(self.out, "{hint}")?;
                Ok(Vec::new())
            }
        }
    }

    fn on_event(&mut self, event: TransportEvent) -> Vec<Action> {
        match event {
            TransportEvent::Accepted {
                channel,
                address,
                local_address,
            } => self.core.on_accepted(address, channel, local_address),
            TransportEvent::Frame { source, bytes } => {
                self.core.on_frame(source, &bytes).unwrap_or_else(|e| {
                    debug!(%source, "dropping frame: {e}");
                    Vec::new()
                })
            }
            TransportEvent::Closed(channel) => self.core.on_closed(channel),
        }
    }

    /// Carry out actions in order, feeding connect results back into the core.
    /// Returns true once a shutdown was requested.
    async fn perform(&mut self, actions: Vec<Action>) -> std::io::Result<bool> {
        let mut queue = VecDeque::from(actions);
        let mut shutdown = false;
        while let Some(action) = queue.pop_front() {
            match action {
                Action::Connect(peer) => {
                    let follow = match self.transport.connect(peer).await {
                        Ok((ChannelHandle::Stream(channel), local)) => {
                            self.core.on_connected(peer, channel, local)
                        }
                        Ok((ChannelHandle::Datagram(_), _)) => Vec::new(),
                        Err(e) => {
                            warn!("{e}");
                            self.core.on_connect_failed(peer)
                        }
                    };
                    queue.extend(follow);
                }
                Action::Send { channel, frame } => {
                    if let Err(e) = self.transport.send(channel, &frame).await {
                        warn!("{e}");
                    }
                }
                Action::Close(channel) => {
                    self.transport.close(ChannelHandle::Stream(channel)).await;
                }
                Action::Notify(notice) => writeln!(self.out, "{notice}")?,
                Action::Shutdown => shutdown = true,
            }
        }
        self.out.flush()?;
        Ok(shutdown)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::datagram::DatagramTransport;
    use crate::stream::StreamTransport;
    use peerchat_core::{SelfIdentity, TransportMode};
    use tokio::io::{AsyncWriteExt, BufReader, DuplexStream};

    /// Output sink the test can read while the loop still owns a clone.
    #[derive(Clone, Default)]
    struct Screen(Arc<Mutex<Vec<u8>>>);

    impl Screen {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }

        async fn wait_for(&self, needle: &str) {
            for _ in 0..250 {
                if self.text().contains(needle) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            panic!("never saw {needle:?}; screen was:\n{}", self.text());
        }
    }

    impl Write for Screen {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            std::io::Write::write(&mut *self.0.lock().unwrap(), buf)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Running {
        keyboard: DuplexStream,
        screen: Screen,
        port: u16,
        task: tokio::task::JoinHandle<anyhow::Result<()>>,
    }

    impl Running {
        async fn type_line(&mut self, line: &str) {
            self.keyboard
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }
    }

    fn spawn<T: Transport + 'static>(name: &str, mode: TransportMode, transport: T) -> Running {
        let port = transport.local_port();
        let core = PeerChatCore::new(SelfIdentity::new(name, port, 11111, 30), mode);
        let screen = Screen::default();
        let (keyboard, input) = tokio::io::duplex(1024);
        let mut event_loop = EventLoop::new(core, transport, screen.clone());
        let task = tokio::spawn(async move {
            event_loop
                .run(BufReader::new(input), std::future::pending())
                .await
        });
        Running {
            keyboard,
            screen,
            port,
            task,
        }
    }

    #[tokio::test]
    async fn queries_then_end_of_input_exits() {
        let transport = StreamTransport::bind(0).await.unwrap();
        let port = transport.local_port();
        let core = PeerChatCore::new(SelfIdentity::new("solo", port, 14623, 21), TransportMode::Stream);
        let mut out = Vec::new();
        let mut event_loop = EventLoop::new(core, transport, &mut out);
        let input: &[u8] = b"/who\n/age abc\n/zip 99999\n";
        event_loop
            .run(input, std::future::pending())
            .await
            .unwrap();
        drop(event_loop);

        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text.lines().collect::<Vec<_>>(),
            vec![
                "[Username: solo | Zip: 14623 | Age: 21]",
                "[Expected: /age <number>]",
                "[Exited]",
            ]
        );
    }

    #[tokio::test]
    async fn shutdown_signal_exits_loop() {
        let transport = DatagramTransport::bind(0).await.unwrap();
        let core = PeerChatCore::new(SelfIdentity::new("solo", 1, 1, 1), TransportMode::Datagram);
        let mut out = Vec::new();
        let (_keyboard, input) = tokio::io::duplex(64);
        EventLoop::new(core, transport, &mut out)
            .run(BufReader::new(input), async {})
            .await
            .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "[Exited]\n");
    }

    async fn two_node_chat<T, F, Fut>(mode: TransportMode, bind: F)
    where
        T: Transport + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = T>,
    {
        let bob = spawn("bob", mode, bind().await);
        let mut alice = spawn("alice", mode, bind().await);

        alice
            .type_line(&format!("/join -p {} 127.0.0.1", bob.port))
            .await;
        alice
            .screen
            .wait_for(&format!("[bob@127.0.0.1:{} has joined", bob.port))
            .await;
        bob.screen
            .wait_for(&format!("[alice@127.0.0.1:{} has joined", alice.port))
            .await;

        alice.type_line("hello bob").await;
        bob.screen.wait_for("<alice> hello bob").await;

        alice.type_line("/join 127.0.0.1").await;
        alice
            .screen
            .wait_for("[Join Failure - Already connected to peers]")
            .await;

        alice.type_line("/exit").await;
        alice.task.await.unwrap().unwrap();
        bob.screen
            .wait_for(&format!("[alice@127.0.0.1:{} left the chat]", alice.port))
            .await;

        drop(bob.keyboard);
        bob.task.await.unwrap().unwrap();
        assert!(bob.screen.text().ends_with("[Exited]\n"));
    }

    #[tokio::test]
    async fn stream_nodes_join_chat_and_part() {
        two_node_chat(TransportMode::Stream, || async {
            StreamTransport::bind(0).await.unwrap()
        })
        .await;
    }

    #[tokio::test]
    async fn datagram_nodes_join_chat_and_part() {
        two_node_chat(TransportMode::Datagram, || async {
            DatagramTransport::bind(0).await.unwrap()
        })
        .await;
    }

    #[tokio::test]
    async fn join_to_nobody_reports_failure() {
        let dead = StreamTransport::bind(0).await.unwrap().local_port();
        let mut node = spawn("lonely", TransportMode::Stream, StreamTransport::bind(0).await.unwrap());
        node.type_line(&format!("/join -p {dead} {}", Ipv4Addr::LOCALHOST))
            .await;
        node.screen
            .wait_for("[Join Failure - Unable to establish connection]")
            .await;
        assert!(node.screen.text().lines().all(|l| !l.contains("has joined")));
    }
}
