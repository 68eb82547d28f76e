use crate::config::Config;
use crate::cycle::{ClientInfo, IoPendingState, PipeWatch, RequestCycle};
use log::{debug, info, warn};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on how long a CGI timeout can go unnoticed.
const TICK: Duration = Duration::from_millis(250);
/// Set on the tokens CGI pipes are registered under; the remaining bits are
/// the owning connection's token.
pub const PIPE_TOKEN_BIT: usize = 1 << (usize::BITS - 2);

pub struct Server {
    poll: Poll,
    registry: Rc<Registry>,
    listeners: Vec<(TcpListener, Token)>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    config: Rc<Config>,
}

struct Connection {
    cycle: RequestCycle<TcpStream>,
    last_activity: Instant,
}

impl Connection {
    /// Runs the cycle and, while the connection stays alive, any request that
    /// is already buffered behind it.
    fn drive(&mut self) {
        self.cycle.run();
        while self.cycle.keep_alive() {
            self.cycle.reset();
            self.cycle.run();
        }
    }

    fn finished(&self) -> bool {
        self.cycle.state() == IoPendingState::EndResponse
    }
}

impl Server {
    pub fn new(config: Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = Rc::new(poll.registry().try_clone()?);
        let mut listeners = Vec::new();

        for addr in config.listen_addrs() {
            let mut listener = TcpListener::bind(addr)?;
            let token = Token(listeners.len());
            registry.register(&mut listener, token, Interest::READABLE)?;
            listeners.push((listener, token));
            info!("Listening on {}", addr);
        }
        let next_token = listeners.len();

        Ok(Server {
            poll,
            registry,
            listeners,
            connections: HashMap::new(),
            next_token,
            config: Rc::new(config),
        })
    }

    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);

        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(TICK)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                let token = event.token();
                if token.0 < self.listeners.len() {
                    self.accept(token.0);
                } else {
                    self.handle_event(event);
                }
            }

            // CGI children are not tied to socket readiness; give every cycle
            // waiting on one a turn so timeouts fire.
            for connection in self.connections.values_mut() {
                if connection.cycle.waiting_on_cgi() {
                    connection.drive();
                }
            }

            self.cleanup();
        }
    }

    fn accept(&mut self, index: usize) {
        loop {
            match self.listeners[index].0.accept() {
                Ok((mut socket, remote)) => {
                    let local = match socket.local_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            warn!("dropping connection from {}: {}", remote, e);
                            continue;
                        }
                    };
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(e) = self.registry.register(
                        &mut socket,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!("cannot register connection from {}: {}", remote, e);
                        continue;
                    }
                    debug!("accepted {} on {} as {:?}", remote, local, token);

                    let watch = PipeWatch {
                        registry: self.registry.clone(),
                        token: Token(token.0 | PIPE_TOKEN_BIT),
                    };
                    let cycle = RequestCycle::new(
                        socket,
                        self.config.clone(),
                        ClientInfo { local, remote },
                        Some(watch),
                    );
                    self.connections.insert(
                        token,
                        Connection {
                            cycle,
                            last_activity: Instant::now(),
                        },
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_event(&mut self, event: &Event) {
        let raw = event.token().0;
        let from_pipe = raw & PIPE_TOKEN_BIT != 0;
        let Some(connection) = self.connections.get_mut(&Token(raw & !PIPE_TOKEN_BIT)) else {
            return;
        };

        if !from_pipe {
            connection.last_activity = Instant::now();
            if event.is_error()
                || (event.is_read_closed() && connection.cycle.waiting_on_cgi())
            {
                debug!(
                    "client of {:?} went away during {}",
                    event.token(),
                    connection.cycle.request().request_line()
                );
                connection.cycle.abort();
                return;
            }
        }
        connection.drive();
    }

    /// Drops finished and idle connections. Dropping a cycle releases any
    /// CGI child it still owns.
    fn cleanup(&mut self) {
        let now = Instant::now();
        let registry = &self.registry;
        self.connections.retain(|token, connection| {
            let idle = now.duration_since(connection.last_activity) > TIMEOUT
                && !connection.cycle.waiting_on_cgi();
            if !connection.finished() && !idle {
                return true;
            }
            if idle {
                debug!("closing idle connection {:?}", token);
            }
            if let Some(socket) = connection.cycle.stream_mut() {
                let _ = registry.deregister(socket);
            }
            false
        });
    }
}
