use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::SharedPasswordSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::store::{Catalog, StoreError};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct GatewayHandler {
    engine: Arc<Engine>,
    catalog: Arc<dyn Catalog>,
    query_parser: Arc<GatewayQueryParser>,
}

impl GatewayHandler {
    pub fn new(engine: Arc<Engine>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            engine,
            catalog,
            query_parser: Arc::new(GatewayQueryParser),
        }
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.dispatch(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn dispatch(&self, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertResource { id, name, is_bookable } => {
                let resource = Resource {
                    id: id.unwrap_or_else(Ulid::new),
                    name,
                    is_bookable,
                };
                self.catalog.create_resource(resource).await.map_err(store_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SetBookable { id, is_bookable } => {
                self.catalog.set_bookable(id, is_bookable).await.map_err(store_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::InsertWindow {
                id,
                resource_id,
                day_of_week,
                start_time,
                end_time,
                capacity,
            } => {
                let window = AvailabilityWindow {
                    id: id.unwrap_or_else(Ulid::new),
                    resource_id,
                    day_of_week,
                    start_time,
                    end_time,
                    capacity,
                };
                self.catalog.add_window(window).await.map_err(store_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteWindow { id } => {
                self.catalog.remove_window(id).await.map_err(store_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertReservation { request, returning } => {
                let reservation = self.engine.submit(&request).await.map_err(engine_err)?;
                if returning {
                    Ok(reservation_rows(std::slice::from_ref(&reservation)))
                } else {
                    Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
                }
            }
            Command::SelectAvailability { query } => {
                let slots = self.engine.availability(&query).await.map_err(engine_err)?;
                // Already validated by the engine; this only recovers the parsed values.
                let (resource_id, date) = query.validate().map_err(engine_err)?;

                let schema = Arc::new(availability_schema());
                let rid = resource_id.to_string();
                let day = date.format(DATE_FORMAT).to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid)?;
                        encoder.encode_field(&day)?;
                        encoder.encode_field(&slot.start_time.format(TIME_FORMAT).to_string())?;
                        encoder.encode_field(&slot.end_time.format(TIME_FORMAT).to_string())?;
                        encoder.encode_field(&clamp_i32(slot.remaining_capacity))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectResources => {
                let resources = self.catalog.list_bookable_resources().await.map_err(store_err)?;
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = resources
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&r.is_bookable)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectWindows { resource_id } => {
                let windows = self.catalog.list_windows(resource_id).await.map_err(store_err)?;
                let schema = Arc::new(windows_schema());
                let rows: Vec<PgWireResult<_>> = windows
                    .into_iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&w.id.to_string())?;
                        encoder.encode_field(&w.resource_id.to_string())?;
                        encoder.encode_field(&i16::from(w.day_of_week))?;
                        encoder.encode_field(&w.start_time.format(TIME_FORMAT).to_string())?;
                        encoder.encode_field(&w.end_time.format(TIME_FORMAT).to_string())?;
                        encoder.encode_field(&clamp_i32(w.capacity))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectReservations { resource_id, date } => {
                let reservations = self
                    .catalog
                    .reservations_on(resource_id, date)
                    .await
                    .map_err(store_err)?;
                Ok(reservation_rows(&reservations))
            }
        }
    }
}

fn reservation_rows(reservations: &[Reservation]) -> Response {
    let schema = Arc::new(reservations_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.resource_id.to_string())?;
            encoder.encode_field(&r.customer_id)?;
            encoder.encode_field(&r.booking_date().format(DATE_FORMAT).to_string())?;
            encoder.encode_field(&r.span.start.format(TIMESTAMP_FORMAT).to_string())?;
            encoder.encode_field(&r.span.end.format(TIMESTAMP_FORMAT).to_string())?;
            encoder.encode_field(&r.status.as_str().to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn clamp_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("resource_id", Type::VARCHAR),
        field("date", Type::DATE),
        field("start_time", Type::TIME),
        field("end_time", Type::TIME),
        field("remaining_capacity", Type::INT4),
    ]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("is_bookable", Type::BOOL),
    ]
}

fn windows_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("day_of_week", Type::INT2),
        field("start_time", Type::TIME),
        field("end_time", Type::TIME),
        field("capacity", Type::INT4),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("resource_id", Type::VARCHAR),
        field("customer_id", Type::VARCHAR),
        field("booking_date", Type::DATE),
        field("start_datetime", Type::TIMESTAMP),
        field("end_datetime", Type::TIMESTAMP),
        field("status", Type::VARCHAR),
    ]
}

/// Result columns a statement will produce, judged from its text.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("RETURNING") {
        return reservations_schema();
    }
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("RESERVATIONS") {
        reservations_schema()
    } else if upper.contains("WINDOWS") {
        windows_schema()
    } else if upper.contains("RESOURCES") {
        resources_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for GatewayHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute_command(cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct GatewayQueryParser;

#[async_trait]
impl QueryParser for GatewayQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for GatewayHandler {
    type Statement = String;
    type QueryParser = GatewayQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute_command(cmd).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();

    // Highest index first so $1 does not clobber the prefix of $10.
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

pub struct GatewayFactory {
    handler: Arc<GatewayHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SharedPasswordSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl GatewayFactory {
    pub fn new(engine: Arc<Engine>, catalog: Arc<dyn Catalog>, password: String) -> Self {
        let auth_source = SharedPasswordSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(GatewayHandler::new(engine, catalog)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for GatewayFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    catalog: Arc<dyn Catalog>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = GatewayFactory::new(engine, catalog, password);
    pgwire::tokio::process_socket(socket, tls, Arc::new(factory)).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::OutOfRange => "22008",
        EngineError::CapacityExceeded { .. } => "23P01",
        EngineError::Internal(_) => "XX000",
    }
}

fn store_sqlstate(e: &StoreError) -> &'static str {
    match e {
        StoreError::NotFound(_) => "P0002",
        StoreError::AlreadyExists(_) => "23505",
        StoreError::InvalidWindow(_) | StoreError::WindowOverlap(_) => "23514",
        StoreError::LimitExceeded(_) => "54000",
        _ => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn store_err(e: StoreError) -> PgWireError {
    if store_sqlstate(&e) == "XX000" {
        tracing::error!("catalog operation failed: {e}");
    }
    user_error(store_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
