use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::auth::FleetBookAuthSource;
use crate::engine::{BookingError, BookingRequest, Engine};
use crate::model::*;
use crate::notify;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

/// Serve one client connection until it closes. Each connection gets its
/// own handler, so LISTEN subscriptions die with the connection.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(FleetBookFactory::new(engine.clone(), password));
    let result = pgwire::tokio::process_socket(socket, tls, factory).await;
    engine.notify.prune();
    result
}

pub struct FleetBookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<FleetBookQueryParser>,
    /// LISTEN subscriptions of this connection, by resource.
    listening: Mutex<HashMap<Ulid, broadcast::Receiver<Event>>>,
}

impl FleetBookHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(FleetBookQueryParser),
            listening: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver everything that arrived on subscribed channels since the
    /// client's last statement.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut listening = self.listening.lock().await;
            for (resource_id, rx) in listening.iter_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(event) => pending
                            .push((notify::channel_name(*resource_id), notify::payload(&event))),
                        Err(TryRecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                "listener on {resource_id} lagged, {skipped} notifications dropped"
                            );
                        }
                        Err(TryRecvError::Empty | TryRecvError::Closed) => break,
                    }
                }
            }
        }

        let pid = std::process::id() as i32;
        for (channel, payload) in pending {
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    pid, channel, payload,
                )))
                .await?;
        }
        Ok(())
    }

    async fn run(&self, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertResource { id, category, seats, status } => {
                engine
                    .create_resource(id, category, seats, status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateResourceStatus { id, status } => {
                engine.update_resource_status(id, status).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::InsertRequester { id, name } => {
                engine.register_requester(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertReservation { id, requester_id, resource_id, start, end } => {
                let request = BookingRequest { id, requester_id, resource_id, start, end };
                engine.create_reservation(request).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelReservation { id, requester_id } => {
                engine.cancel_reservation(id, requester_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::CompleteReservation { id } => {
                engine.complete_reservation(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectAvailability { resource_id, start, end } => {
                let available = engine.check_availability(resource_id, start, end).await;
                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&resource_id.to_string())?;
                encoder.encode_field(&start)?;
                encoder.encode_field(&end)?;
                encoder.encode_field(&available)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAvailableResources { start, end, filter } => {
                let infos = engine.available_resources(&filter, start, end).await;
                resource_rows(infos)
            }
            Command::SelectResources => resource_rows(engine.list_resources().await),
            Command::SelectReservation { id } => {
                let reservation = engine.get_reservation(id).await.map_err(engine_err)?;
                reservation_rows(vec![reservation])
            }
            Command::SelectReservationsByRequester { requester_id, status } => {
                reservation_rows(engine.find_by_requester(requester_id, status).await)
            }
            Command::SelectReservationsByResource { resource_id } => {
                let reservations = engine
                    .reservations_for_resource(resource_id)
                    .await
                    .map_err(engine_err)?;
                reservation_rows(reservations)
            }
            Command::Listen { channel } => {
                let resource_id = parse_channel(&channel)?;
                let mut listening = self.listening.lock().await;
                listening
                    .entry(resource_id)
                    .or_insert_with(|| engine.notify.subscribe(resource_id));
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                let resource_id = parse_channel(&channel)?;
                self.listening.lock().await.remove(&resource_id);
                engine.notify.prune();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.listening.lock().await.clear();
                engine.notify.prune();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("resource_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("available", Type::BOOL),
    ]
}

fn resource_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("category", Type::VARCHAR),
        text_field("seats", Type::INT8),
        text_field("status", Type::VARCHAR),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("resource_id", Type::VARCHAR),
        text_field("requester_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("created_at", Type::INT8),
    ]
}

/// Result columns for a statement, judged from its text so that it works
/// before parameters are bound.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABLE_RESOURCES") || upper.contains("FROM RESOURCES") {
        resource_schema()
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("RESERVATIONS") {
        reservation_schema()
    } else {
        vec![]
    }
}

fn resource_rows(infos: Vec<ResourceInfo>) -> PgWireResult<Response> {
    let schema = Arc::new(resource_schema());
    let rows: Vec<PgWireResult<_>> = infos
        .into_iter()
        .map(|info| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&info.id.to_string())?;
            encoder.encode_field(&info.category)?;
            encoder.encode_field(&i64::from(info.seats))?;
            encoder.encode_field(&info.status.to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn reservation_rows(reservations: Vec<Reservation>) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.resource_id.to_string())?;
            encoder.encode_field(&r.requester_id.to_string())?;
            encoder.encode_field(&r.span.start)?;
            encoder.encode_field(&r.span.end)?;
            encoder.encode_field(&r.status.to_string())?;
            encoder.encode_field(&r.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix("resource_").ok_or_else(|| {
        user_error("42602", format!("invalid channel: {channel} (expected resource_{{id}})"))
    })?;
    Ulid::from_string(id).map_err(|e| user_error("42602", format!("bad ULID in channel: {e}")))
}

#[async_trait]
impl SimpleQueryHandler for FleetBookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.flush_notifications(client).await?;
        // Statements run in order; the first failure ends the batch and the
        // ones before it stay committed.
        let commands = sql::parse_batch(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(commands.len());
        for cmd in commands {
            responses.push(self.run(cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FleetBookQueryParser;

#[async_trait]
impl QueryParser for FleetBookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FleetBookHandler {
    type Statement = String;
    type QueryParser = FleetBookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.flush_notifications(client).await?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(cmd).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(param_types, schema_for_sql(&target.statement)))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for_sql(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FleetBookFactory {
    handler: Arc<FleetBookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FleetBookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FleetBookFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = FleetBookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FleetBookHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FleetBookFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for each engine failure.
pub fn sqlstate(e: &BookingError) -> &'static str {
    match e {
        BookingError::InvalidInterval(_) => "22023",
        BookingError::RequesterNotFound(_)
        | BookingError::ResourceNotFound(_)
        | BookingError::ReservationNotFound(_) => "P0002",
        BookingError::ResourceUnavailable { .. } | BookingError::InvalidTransition { .. } => {
            "55000"
        }
        BookingError::OverlapConflict(_) => "23P01",
        BookingError::LockTimeout(_) => "55P03",
        BookingError::StorageFailure(_) => "58030",
        BookingError::AlreadyExists(_) => "23505",
        BookingError::NotOwner(_) => "42501",
        BookingError::LimitExceeded(_) => "54000",
    }
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: BookingError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::LimitExceeded(_) => "54000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_counted_by_highest_index() {
        assert_eq!(count_params("SELECT * FROM resources"), 0);
        assert_eq!(count_params("UPDATE reservations SET status = $2 WHERE id = $1"), 2);
        assert_eq!(count_params("SELECT * FROM reservations WHERE id = $10"), 10);
    }

    #[test]
    fn schema_follows_table() {
        let names = |sql: &str| -> Vec<String> {
            schema_for_sql(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("SELECT * FROM resources").len(), 4);
        assert_eq!(
            names("select * from availability where resource_id = $1 and start >= $2 and \"end\" <= $3")
                .last()
                .map(String::as_str),
            Some("available")
        );
        let sql = "SELECT * FROM available_resources WHERE start >= 1 AND \"end\" <= 2";
        assert_eq!(names(sql)[0], "id");
        assert_eq!(names("SELECT * FROM reservations WHERE requester_id = $1").len(), 7);
        assert!(names("INSERT INTO reservations (id) VALUES ($1)").is_empty());
    }

    #[test]
    fn sqlstates_are_distinct_where_it_matters() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&BookingError::OverlapConflict(id)), "23P01");
        assert_eq!(sqlstate(&BookingError::LockTimeout(id)), "55P03");
        assert_eq!(
            sqlstate(&BookingError::ResourceUnavailable {
                id,
                status: ResourceStatus::Maintenance,
            }),
            "55000"
        );
        assert_eq!(sqlstate(&BookingError::InvalidInterval("start and end are required")), "22023");
        assert_eq!(sqlstate(&BookingError::ReservationNotFound(id)), "P0002");
    }

    #[test]
    fn channel_names_round_trip() {
        let id = Ulid::new();
        assert_eq!(parse_channel(&notify::channel_name(id)).unwrap(), id);
        assert!(parse_channel("bookings").is_err());
        assert!(parse_channel("resource_nope").is_err());
    }
}
