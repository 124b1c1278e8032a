use crate::{
    errors::ErrorKind,
    http::{
        request::{Parser, Request},
        response::Response,
        types::Version,
    },
    limits::{ConnLimits, Http09Limits, ReqLimits, RespLimits, ServerLimits, TraceLimits},
    pipeline::{packet::Packet, queue::Queue},
    server::{
        connector::Connector,
        listener::{AllLimits, Handler},
        trace::{Direction, TraceConfig, TraceItem},
    },
    Handled,
};
use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Instant};
use tokio::{io::AsyncWriteExt, net::TcpStream, time::sleep};

pub(crate) struct HttpConnection<H: Handler<S>, S: ConnectionData> {
    handler: Arc<H>,
    connection_data: S,

    connection: Connection,
    pub(crate) parser: Parser,
    pub(crate) request: Request,
    pub(crate) response: Response,

    pub(crate) server_limits: ServerLimits,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) http_09_limits: Option<Http09Limits>,
    pub(crate) req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
    pub(crate) trace_limits: TraceLimits,
    trace: TraceConfig,
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) fn new(handler: Arc<H>, limits: AllLimits) -> Self {
        Self {
            handler,
            connection_data: S::new(),

            connection: Connection::new(),
            parser: Parser::new(&limits.3),
            request: Request::new(&limits.3),
            response: Response::new(&limits.4),

            server_limits: limits.0,
            conn_limits: limits.1,
            http_09_limits: limits.2,
            req_limits: limits.3,
            resp_limits: limits.4,
            trace_limits: limits.5,
            trace: TraceConfig::new(),
        }
    }

    #[inline]
    fn reset_request_response(&mut self) {
        self.parser.reset();
        self.request.reset();
        self.response.reset(&self.resp_limits);
    }
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    pub(crate) async fn run(
        &mut self,
        stream: &mut TcpStream,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
    ) -> Result<(), io::Error> {
        self.request.client_addr = client_addr;
        self.request.server_addr = server_addr;

        self.trace_conn(&format!("connection accepted client={client_addr}"));
        let result = match self.impl_run(stream).await {
            Ok(()) => Ok(()),
            Err(ErrorKind::Io(e)) => Err(e.0),
            Err(error) => {
                self.trace_conn(&format!(
                    "connection closed with an error response client={client_addr} error={error:?}"
                ));
                self.conn_limits
                    .send_error(
                        stream,
                        error,
                        self.request.version(),
                        self.server_limits.json_errors,
                    )
                    .await
            }
        };
        self.trace_conn(&format!(
            "connection closed client={client_addr} requests={}",
            self.connection.request_count
        ));
        result
    }

    /// Logs a connection-lifecycle event through [`TraceConfig`], the same
    /// per-direction verbosity gate [`trace_content`](Self::trace_rx_body)
    /// uses, instead of an ungated `tracing` call.
    #[inline]
    fn trace_conn(&self, msg: &str) {
        if let Some(level) = self.trace.should_trace(TraceItem::Conn, None) {
            tracing::event!(
                tracing::Level::TRACE,
                tag = "Conn",
                conn = self.connection.request_count as u64,
                level,
                "{msg}"
            );
        }
    }

    #[inline]
    pub(crate) async fn impl_run(&mut self, stream: &mut TcpStream) -> Result<(), ErrorKind> {
        self.connection.reset();
        self.connection_data.reset();
        self.connection.state = ConnState::Connected;

        while !self.is_expired()? {
            self.reset_request_response();
            self.connection.state = ConnState::Begin;

            if self.advance(stream).await? {
                break;
            }

            self.connection.request_count += 1;
        }

        self.connection.state = ConnState::Complete;
        Ok(())
    }

    /// Drives one request/response cycle through [`ConnState`], returning
    /// `true` once no further requests will follow on this connection
    /// (socket closed by the peer, or the response declined keep-alive).
    ///
    /// `advancing` guards against a nested call driving the same
    /// connection concurrently; nothing in this driver actually recurses,
    /// but the guard documents the invariant the same way the source's
    /// `conn->advancing` flag does around `httpIOEvent`.
    async fn advance(&mut self, stream: &mut TcpStream) -> Result<bool, ErrorKind> {
        debug_assert!(!self.connection.advancing, "HttpConnection::advance called re-entrantly");
        self.connection.advancing = true;

        let result = self.advance_inner(stream).await;

        self.connection.advancing = false;
        result
    }

    async fn advance_inner(&mut self, stream: &mut TcpStream) -> Result<bool, ErrorKind> {
        self.connection.state = ConnState::Connected;
        if !self.read_until_parseable(stream).await? {
            return Ok(true);
        }
        self.connection.state = ConnState::First;

        self.response.version = loop {
            match self.parse() {
                Ok(version) => break version,
                Err(e) if self.retriable(&e) => self.retry_read(stream).await?,
                Err(e) => return Err(e),
            }
        };
        self.connection.state = ConnState::Parsed;

        // Body bytes are already fully buffered by `parse`'s `check_body`
        // step, so `Content` is reached immediately rather than driving a
        // separate streaming read here.
        self.connection.state = ConnState::Content;
        self.trace_rx_body();

        self.connection.state = ConnState::Running;
        self.trace_conn(&format!("dispatching to handler state={:?}", self.connection.state()));
        if self
            .handler
            .authenticate(&self.request, &mut self.response)
            .await
            .is_err()
        {
            self.transmit(stream).await?;
            self.connection.state = ConnState::Complete;
            return Ok(!self.response.keep_alive);
        }

        self.handler
            .handle(&mut self.connection_data, &self.request, &mut self.response)
            .await;

        self.transmit(stream).await?;
        self.connection.state = ConnState::Complete;

        Ok(!self.response.keep_alive)
    }

    /// Reads until the buffer holds what looks like a complete request head,
    /// or is full (so `parse` can fail with a concrete error instead of
    /// looping forever), looping over [`Parser::fill_buffer`] since a
    /// request line or header block can straddle several TCP reads. Returns
    /// `false` only when the peer closed the connection before sending
    /// anything at all, the normal end of a keep-alive connection.
    async fn read_until_parseable(&mut self, stream: &mut TcpStream) -> Result<bool, ErrorKind> {
        loop {
            if self.parser.request_head_complete() || self.parser.is_full() {
                return Ok(true);
            }

            let n = self
                .parser
                .fill_buffer(stream, self.conn_limits.socket_read_timeout)
                .await?;

            if n == 0 {
                if self.parser.is_empty() {
                    return Ok(false);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-request",
                )
                .into());
            }
        }
    }

    /// Whether a parse failure looks like "not enough bytes yet" rather
    /// than a genuinely malformed request: a short Content-Length or
    /// chunked body reports `expected > available`, and a request whose
    /// head straddles two reads surfaces as `InvalidHeader` before the
    /// buffer holds a full line or header block. Neither is retriable once
    /// the buffer is full — there's no more room to read into, so a
    /// `BodyMismatch`/`InvalidHeader` at that point is final.
    fn retriable(&self, err: &ErrorKind) -> bool {
        if self.parser.is_full() {
            return false;
        }
        match err {
            ErrorKind::BodyMismatch { expected, available } => expected > available,
            ErrorKind::InvalidHeader => !self.parser.request_head_complete(),
            _ => false,
        }
    }

    /// Discards the partially-populated request and re-parses from the
    /// start once more bytes have arrived. `Parser::rewind` keeps the bytes
    /// already accumulated (only `fill_buffer` appends past them), so this
    /// re-parses the same header/body bytes plus whatever this read added.
    async fn retry_read(&mut self, stream: &mut TcpStream) -> Result<(), ErrorKind> {
        self.request.reset();
        self.parser.rewind();

        let n = self
            .parser
            .fill_buffer(stream, self.conn_limits.socket_read_timeout)
            .await?;

        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-request",
            )
            .into());
        }
        Ok(())
    }

    /// Traces the decoded request body, if any, through [`TraceConfig`].
    fn trace_rx_body(&mut self) {
        let body = self.request.body().unwrap_or(&[]).to_vec();
        let packet = Packet::create_data(body);

        self.connection.rx_bytes += packet.len() as u64;
        self.trace.trace_content(
            Direction::Rx,
            TraceItem::Body,
            &packet,
            self.connection.request_count as u64,
            self.connection.rx_bytes,
            self.trace_limits.max_body,
        );
    }

    /// Drains the finished response onto the socket through a single-packet
    /// [`Queue`]/[`Connector`] chain, tracing it through [`TraceConfig`] the
    /// same way [`trace_rx_body`](Self::trace_rx_body) does for the request.
    async fn transmit(&mut self, stream: &mut TcpStream) -> Result<(), ErrorKind> {
        let packet = Packet::create_data(self.response.buffer().clone());

        self.connection.tx_bytes += packet.len() as u64;
        self.trace.trace_content(
            Direction::Tx,
            TraceItem::Body,
            &packet,
            self.connection.request_count as u64,
            self.connection.tx_bytes,
            self.trace_limits.max_body,
        );

        let mut queue = Queue::new("tx", packet.len());
        let packet_len = packet.len() as u64;
        queue.put_for_service(packet);

        Connector::new(packet_len).service(stream, &mut queue).await
    }
}

impl ConnLimits {
    #[inline]
    pub(crate) async fn send_error(
        &self,
        stream: &mut TcpStream,
        error: ErrorKind,
        version: Version,
        json_errors: bool,
    ) -> Result<(), io::Error> {
        self.write_bytes(stream, error.as_http(version, json_errors))
            .await
    }

    #[inline]
    pub(crate) async fn write_bytes(
        &self,
        stream: &mut TcpStream,
        response: &[u8],
    ) -> Result<(), io::Error> {
        tokio::select! {
            biased;

            result = stream.write_all(response) => result,
            _ = sleep(self.socket_write_timeout) => {
                Err(io::Error::new(io::ErrorKind::TimedOut, "write timeout"))
            },
        }
    }
}

macro_rules! is_expired {
    ($self:expr, $limits:expr) => {
        Ok(!$self.response.keep_alive
            || $self.connection.request_count >= $limits.max_requests_per_connection
            || $self.connection.created.elapsed() > $limits.connection_lifetime)
    };
}

impl<H: Handler<S>, S: ConnectionData> HttpConnection<H, S> {
    #[inline]
    fn is_expired(&self) -> Result<bool, ErrorKind> {
        match (self.response.version, &self.http_09_limits) {
            (Version::Http09, Some(limits)) => is_expired!(self, limits),
            (Version::Http09, None) => Err(ErrorKind::UnsupportedVersion),
            _ => is_expired!(self, self.conn_limits),
        }
    }
}

/// Where a connection is in the request/response cycle. Advances strictly
/// forward within one cycle and resets to `Begin` for the next
/// keep-alive request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Begin,
    Connected,
    First,
    Parsed,
    Content,
    Running,
    Complete,
}

#[derive(Debug)]
pub(crate) struct Connection {
    created: Instant,
    request_count: usize,
    state: ConnState,
    advancing: bool,
    rx_bytes: u64,
    tx_bytes: u64,
}

impl Connection {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            request_count: 0,
            state: ConnState::Begin,
            advancing: false,
            rx_bytes: 0,
            tx_bytes: 0,
        }
    }

    #[inline]
    pub(crate) fn reset(&mut self) {
        self.created = Instant::now();
        self.request_count = 0;
        self.state = ConnState::Begin;
        self.advancing = false;
        self.rx_bytes = 0;
        self.tx_bytes = 0;
    }

    #[inline]
    pub(crate) fn state(&self) -> ConnState {
        self.state
    }
}

//

/// Managing user session data stored between requests within a single HTTP connection.
///
/// This trait allows you to store arbitrary state (e.g., authentication data,
/// multistep form status, cache, etc.). The state is available across all requests
/// within a single HTTP keep-alive connection.
///
/// # Examples
/// ```no_run
/// use embedhttp_core::ConnectionData;
/// use std::collections::HashMap;
///
/// struct MyConnectionData {
///     user_id: Option<i32>,
///     request_count: usize,
///     cache: HashMap<usize, [u8; 4]>,
/// }
///
/// impl ConnectionData for MyConnectionData {
///     fn new() -> Self {
///         Self {
///             user_id: None,
///             request_count: 0,
///             cache: HashMap::new(),
///         }
///     }
///
///     fn reset(&mut self) {
///         self.user_id = None;
///         self.request_count = 0;
///         self.cache.clear(); // Saving the allocated memory
///     }
/// }
/// ```
///
/// Check out a real-world example in `demos/request_counter.rs` (well, almost)
pub trait ConnectionData: Sync + Send + 'static {
    /// Creates a new instance of user data.
    ///
    /// It is called once at server startup, which avoids runtime allocations.
    fn new() -> Self;

    /// Resets the internal state of the instance to its initial values.
    ///
    /// It is called after the connection is closed. Allows repeated
    /// use of the instance for the following connections. If implemented
    /// correctly, avoids any allocations.
    fn reset(&mut self);
}

impl ConnectionData for () {
    #[inline(always)]
    fn new() -> Self {}

    #[inline(always)]
    fn reset(&mut self) {}
}

/// A trait for filtering TCP connections before HTTP processing.
///
/// # Examples
///
/// Simple IP Blacklist:
/// ```
/// use std::{collections::HashSet, net::{SocketAddr, IpAddr}};
/// use embedhttp_core::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// struct MyConnFilter {
///     blacklist: HashSet<IpAddr>
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(
///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
///     ) -> Result<(), Handled> {
///         if self.blacklist.contains(&client_addr.ip()) {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("Your IP is permanently banned"))
///         } else {
///             Ok(())
///         }
///     }
/// }
/// ```
/// File-based IP blacklist:
/// ```
/// use std::net::SocketAddr;
/// use embedhttp_core::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// # struct DatabaseClient;
/// #
/// # impl DatabaseClient {
/// #     async fn execute(&self, _: &str) -> Option<Vec<&str>> {
/// #         Some(vec!["true"])
/// #     }
/// # }
/// #
/// #
/// struct MyConnFilter {
///     db: DatabaseClient
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut Response) -> Result<(), Handled> {
///         Ok(())
///     }
///
///     async fn filter_async(
///         &self,
///         client_addr: SocketAddr,
///         _: SocketAddr,
///         err_resp: &mut Response,
///     ) -> Result<(), Handled> {
///         let request = format!(
///             "SELECT EXISTS (SELECT 1 FROM ip_blacklist WHERE ip_address = '{}')",
///             client_addr.ip()
///         );
///
///         if self.db.execute(&request).await == Some(vec!["false"]) {
///             Ok(()) // IP not found in blacklist
///         } else {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("IP found in blacklist file"))
///         }
///     }
/// }
/// ```
/// Two-stage filtering with cache:
/// ```
/// use std::{collections::HashSet, sync::RwLock, net::{SocketAddr, IpAddr}};
/// use embedhttp_core::{Server, ConnectionFilter, Response, Handled, StatusCode};
///
/// # struct DatabaseClient;
/// #
/// # impl DatabaseClient {
/// #     async fn execute(&self, _: &str) -> Option<Vec<&str>> {
/// #         Some(vec!["true"])
/// #     }
/// # }
/// #
/// #
/// struct MyConnFilter {
///     cache: RwLock<HashSet<IpAddr>>,
///     db: DatabaseClient,
/// }
///
/// impl ConnectionFilter for MyConnFilter {
///     fn filter(
///         &self, client_addr: SocketAddr, _: SocketAddr, err_resp: &mut Response
///     ) -> Result<(), Handled> {
///         let Ok(guard) = self.cache.read() else {
///             return Err(err_resp.status(StatusCode::InternalServerError)
///                 .body("Internal server error"));
///         };
///
///         if guard.contains(&client_addr.ip()) {
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("Your IP is permanently banned"))
///         } else {
///             Ok(())
///         }
///     }
///
///     async fn filter_async(
///         &self,
///         client_addr: SocketAddr,
///         _: SocketAddr,
///         err_resp: &mut Response,
///     ) -> Result<(), Handled> {
///         let request = format!(
///             "SELECT EXISTS (SELECT 1 FROM ip_blacklist WHERE ip_address = '{}')",
///             client_addr.ip()
///         );
///
///         if self.db.execute(&request).await == Some(vec!["false"]) {
///             Ok(()) // IP not found in blacklist
///         } else {
///             let Ok(mut guard) = self.cache.write() else {
///                 return Err(err_resp.status(StatusCode::InternalServerError)
///                     .body("Internal server error"));
///             };
///             guard.insert(client_addr.ip());
///
///             Err(err_resp
///                 .status(StatusCode::Forbidden)
///                 .body("IP found in blacklist file"))
///         }
///     }
/// }
/// ```
/// # Connection Filter Architecture
/// ```text
///                     [ QUEUE TCP_STREAM ]
///                              ||
/// /----------------------------||----------------------------------\
/// |                            || TCP_STREAM            Tokio Task |
/// |       /=====================/                                  |
/// |       \/                                                       |
/// |   [--------]   Err(Handled)   [----------------------]         |
/// |   [ filter ] ===============> [ Send `error_response`]         |
/// |   [--------]                  [----------------------]         |
/// |       ||                                 /\                    |
/// |       || Ok(())                          ||                    |
/// |       \/                Err(Handled)     ||                    |
/// |   [--------------] ========================/                   |
/// |   [ filter_async ]                             [-----------]   |
/// |   [--------------] ==========================> [  Handler  ]   |
/// |                             Ok(())             [-----------]   |
/// |                                                                |
/// \----------------------------------------------------------------/
/// ```
pub trait ConnectionFilter: Sync + Send + 'static {
    /// Synchronous connection validation.
    ///
    /// Perform fast, in-memory checks here. Expensive operations should be deferred
    /// to [`filter_async`](Self::filter_async).
    ///
    /// Use for:
    /// - IP blacklist/whitelist (in-memory cache)
    /// - Geographic IP restrictions
    /// - Rate limiting counters
    fn filter(
        &self,
        client_addr: SocketAddr,
        server_addr: SocketAddr,
        error_response: &mut Response,
    ) -> Result<(), Handled>;

    /// Asynchronous connection inspection.
    ///
    /// Called after [`filter`](Self::filter) succeeds.Executes asynchronously within
    /// the Tokio runtime.
    ///
    /// Use for:
    /// - Database lookups
    /// - External API calls
    /// - File system operations
    /// - Complex business logic
    /// - Machine learning inference
    fn filter_async(
        &self,
        #[allow(unused_variables)] client_addr: SocketAddr,
        #[allow(unused_variables)] server_addr: SocketAddr,
        #[allow(unused_variables)] error_response: &mut Response,
    ) -> impl Future<Output = Result<(), Handled>> + Send {
        async { Ok(()) }
    }
}

impl ConnectionFilter for () {
    fn filter(&self, _: SocketAddr, _: SocketAddr, _: &mut Response) -> Result<(), Handled> {
        Ok(())
    }
}

//

#[cfg(test)]
mod def_handler {
    use super::*;
    use crate::{Handled, StatusCode};

    pub(crate) struct DefHandler;

    impl Handler<()> for DefHandler {
        async fn handle(&self, _: &mut (), _: &Request, r: &mut Response) -> Handled {
            r.status(StatusCode::Ok).body("test")
        }
    }

    impl HttpConnection<DefHandler, ()> {
        #[inline]
        pub(crate) fn from_req<V: AsRef<[u8]>>(value: V) -> Self {
            let req_limits = ReqLimits::default().precalculate();
            let resp_limits = RespLimits::default();

            Self {
                handler: Arc::new(DefHandler),
                connection_data: (),

                connection: Connection::new(),
                parser: Parser::from(&req_limits, value),
                request: Request::new(&req_limits),
                response: Response::new(&resp_limits),

                server_limits: ServerLimits::default(),
                conn_limits: ConnLimits::default(),
                http_09_limits: None,
                req_limits,
                resp_limits,
                trace_limits: crate::limits::TraceLimits::default(),
                trace: TraceConfig::new(),
            }
        }
    }
}
