use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse, Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::ReservdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, TENANT_ERRORS_TOTAL, command_label};
use crate::sql::{self, Command, ReservationFilter, ResourceFilter, SqlError};
use crate::tenant::TenantManager;

const HEALTHY: &str = "server healthy";

pub struct ReservdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ReservdQueryParser>,
}

impl ReservdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ReservdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            metrics::counter!(TENANT_ERRORS_TOTAL).increment(1);
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    /// Parse and run one statement, recording query metrics.
    async fn run_sql<C: ClientInfo>(&self, client: &C, query: &str, format: &Format) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(|e| {
            metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error").increment(1);
            sql_err(e)
        })?;

        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(&engine, cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command, format: &Format) -> PgWireResult<Response> {
        match cmd {
            Command::InsertResource { name } => {
                let resource = engine.create_resource(&name).await.map_err(engine_err)?;
                resource_rows(vec![resource], format)
            }
            Command::InsertReservation { resource_id, start, end } => {
                let request = NewReservation::parse(&resource_id, start, end).map_err(engine_err)?;
                let reservation = engine.reserve(request).await.map_err(engine_err)?;
                reservation_rows(vec![reservation], format)
            }
            Command::SelectResources { filter } => {
                let resources = match filter {
                    ResourceFilter::All => engine.list_resources().await,
                    ResourceFilter::ById(id) => engine.get_resource(&id).await.map(|r| vec![r]),
                    ResourceFilter::NamePrefix(prefix) => engine.find_resources_by_name_prefix(&prefix).await,
                }
                .map_err(engine_err)?;
                resource_rows(resources, format)
            }
            Command::SelectReservations { filter } => {
                let reservations = match filter {
                    ReservationFilter::All => engine.list_reservations().await,
                    ReservationFilter::ByResource(id) => match parse_id(&id) {
                        Ok(resource_id) => engine.list_reservations_by_resource(resource_id).await,
                        Err(e) => Err(e),
                    },
                    ReservationFilter::ById(id) => engine.get_reservation(&id).await.map(|r| vec![r]),
                }
                .map_err(engine_err)?;
                reservation_rows(reservations, format)
            }
            Command::Health => {
                let schema = Arc::new(health_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&HEALTHY.to_string())?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

/// Columns in the result format the client asked for.
fn schema(columns: &[(&str, Type)], format: &Format) -> Vec<FieldInfo> {
    columns
        .iter()
        .enumerate()
        .map(|(i, (name, ty))| FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i)))
        .collect()
}

fn resource_schema(format: &Format) -> Vec<FieldInfo> {
    schema(&[("id", Type::VARCHAR), ("name", Type::VARCHAR)], format)
}

fn reservation_schema(format: &Format) -> Vec<FieldInfo> {
    schema(
        &[
            ("id", Type::VARCHAR),
            ("resource_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
        ],
        format,
    )
}

fn health_schema(format: &Format) -> Vec<FieldInfo> {
    schema(&[("status", Type::VARCHAR)], format)
}

fn resource_rows(resources: Vec<Resource>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(resource_schema(format));
    let rows: Vec<PgWireResult<_>> = resources
        .into_iter()
        .map(|resource| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&resource.id.to_string())?;
            encoder.encode_field(&resource.name)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn reservation_rows(reservations: Vec<Reservation>, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema(format));
    let rows: Vec<PgWireResult<_>> = reservations
        .into_iter()
        .map(|reservation| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&reservation.id.to_string())?;
            encoder.encode_field(&reservation.resource_id.to_string())?;
            encoder.encode_field(&reservation.span.start)?;
            encoder.encode_field(&reservation.span.end)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Result columns of a statement that may still hold `$n` placeholders.
/// Unparseable statements describe no columns; the error surfaces on execute.
fn describe_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let sample = substitute_placeholders(sql, &vec![Some(b"0".to_vec()); count_params(sql)]);
    match sql::parse_sql(&sample) {
        Ok(Command::InsertResource { .. } | Command::SelectResources { .. }) => resource_schema(format),
        Ok(Command::InsertReservation { .. } | Command::SelectReservations { .. }) => reservation_schema(format),
        Ok(Command::Health) => health_schema(format),
        Err(_) => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for ReservdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run_sql(client, query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ReservdQueryParser;

#[async_trait]
impl QueryParser for ReservdQueryParser {
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

    fn get_result_schema(&self, stmt: &String, column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(describe_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ReservdHandler {
    type Statement = String;
    type QueryParser = ReservdQueryParser;

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
        let sql = substitute_placeholders(&portal.statement.statement, &portal.parameters);
        self.run_sql(client, &sql, &portal.result_column_format).await
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
        Ok(DescribeStatementResponse::new(
            param_types,
            describe_schema(&target.statement, &Format::UnifiedText),
        ))
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
        Ok(DescribePortalResponse::new(describe_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
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

/// Substitute $1, $2, ... with bound parameter values (text format) as
/// quoted literals. Highest index first so `$1` never clobbers `$10`.
fn substitute_placeholders<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ReservdFactory {
    handler: Arc<ReservdHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<ReservdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ReservdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = ReservdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ReservdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ReservdFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(ReservdFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidId(_) => "22P02",
        EngineError::InvalidName(_) => "22023",
        EngineError::InvalidInterval { .. } => "22007",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::ResourceNotFound(_) | EngineError::ReservationNotFound(_) => "02000",
        EngineError::DuplicateName(_) => "23505",
        EngineError::ResourceUnavailable { .. } => "23P01",
        EngineError::StorageFailure(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    debug!("query failed: {e}");
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}
