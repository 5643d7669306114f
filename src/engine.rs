//! Client side of a statistical-computation engine.
//!
//! The protocol is the one an R server speaks: matrices are built in a named
//! workspace variable row by row, then an expression is evaluated and its value
//! comes back as a flattened numeric array or a list of strings. Requests are
//! typed ([`EngineRequest`]) and render as the expression they stand for.
//!
//! Connections are drawn from a bounded [`EnginePool`]. A [`PooledConnection`]
//! goes back to the pool when dropped, on every exit path; a connection marked
//! with [`PooledConnection::invalidate`] is discarded and re-established instead
//! of being reused.
//!
//! [`EmbeddedEngine`] is an in-process engine speaking the same protocol.

use crate::error::EngineError;
use crate::linalg_backends::{BackendSVD, LinAlgBackendProvider};
use crate::prcomp::{prcomp, PrcompOptions};
use log::{debug, info, trace, warn};
use ndarray::{s, Array2, ShapeBuilder};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Storage order of a flattened numeric reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    ColumnMajor,
    RowMajor,
}

/// Value returned by an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineValue {
    Numeric {
        values: Vec<f64>,
        nrow: usize,
        ncol: usize,
        layout: Layout,
    },
    Strings(Vec<String>),
}

impl EngineValue {
    pub fn vector(values: Vec<f64>) -> Self {
        let nrow = values.len();
        EngineValue::Numeric { values, nrow, ncol: 1, layout: Layout::ColumnMajor }
    }

    /// Column-major flattening of `matrix`, the way the engine stores matrices.
    pub fn from_matrix(matrix: &Array2<f64>) -> Self {
        EngineValue::Numeric {
            values: matrix.t().iter().copied().collect(),
            nrow: matrix.nrows(),
            ncol: matrix.ncols(),
            layout: Layout::ColumnMajor,
        }
    }

    /// De-flattens a numeric reply into an `(nrow, ncol)` matrix according to its layout.
    pub fn into_matrix(self) -> Result<Array2<f64>, EngineError> {
        match self {
            EngineValue::Numeric { values, nrow, ncol, layout } => {
                if values.len() != nrow * ncol {
                    return Err(EngineError::MalformedReply(format!(
                        "{} values cannot fill a {}x{} matrix",
                        values.len(),
                        nrow,
                        ncol
                    )));
                }
                let shaped = match layout {
                    Layout::ColumnMajor => Array2::from_shape_vec((nrow, ncol).f(), values),
                    Layout::RowMajor => Array2::from_shape_vec((nrow, ncol), values),
                }
                .map_err(|e| EngineError::MalformedReply(e.to_string()))?;
                Ok(shaped.as_standard_layout().into_owned())
            }
            EngineValue::Strings(_) => {
                Err(EngineError::MalformedReply("expected a numeric matrix, got strings".to_string()))
            }
        }
    }

    pub fn into_vector(self) -> Result<Vec<f64>, EngineError> {
        match self {
            EngineValue::Numeric { values, .. } => Ok(values),
            EngineValue::Strings(_) => {
                Err(EngineError::MalformedReply("expected a numeric vector, got strings".to_string()))
            }
        }
    }

    pub fn into_strings(self) -> Result<Vec<String>, EngineError> {
        match self {
            EngineValue::Strings(values) => Ok(values),
            EngineValue::Numeric { .. } => {
                Err(EngineError::MalformedReply("expected strings, got a numeric value".to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrcompPart {
    Rotation,
    RotationRowNames,
    Sdev,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvdPart {
    D,
    U,
    V,
}

/// An expression evaluated against a workspace variable.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineRequest {
    Prcomp {
        var: String,
        options: PrcompOptions,
        part: PrcompPart,
    },
    Svd {
        var: String,
        nu: usize,
        nv: usize,
        part: SvdPart,
    },
}

fn r_bool(value: bool) -> &'static str {
    if value { "TRUE" } else { "FALSE" }
}

impl fmt::Display for EngineRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineRequest::Prcomp { var, options, part } => {
                let mut call = format!(
                    "prcomp({}, center={}, scale.={}",
                    var,
                    r_bool(options.center),
                    r_bool(options.scale)
                );
                if let Some(tol) = options.tol {
                    call.push_str(&format!(", tol={}", tol));
                }
                call.push(')');
                match part {
                    PrcompPart::Rotation => write!(f, "{}$rotation", call),
                    PrcompPart::RotationRowNames => write!(f, "rownames({}$rotation)", call),
                    PrcompPart::Sdev => write!(f, "{}$sdev", call),
                }
            }
            EngineRequest::Svd { var, nu, nv, part } => {
                let field = match part {
                    SvdPart::D => "d",
                    SvdPart::U => "u",
                    SvdPart::V => "v",
                };
                write!(f, "svd({}, nu={}, nv={})${}", var, nu, nv, field)
            }
        }
    }
}

/// Which dimension a names vector labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameAxis {
    Rows,
    Columns,
}

/// One live session with an engine.
pub trait EngineConnection: Send {
    /// Creates (or replaces) a zero-filled `nrow x ncol` matrix variable.
    fn create_matrix(&mut self, var: &str, nrow: usize, ncol: usize) -> Result<(), EngineError>;

    /// Assigns one row of a matrix variable.
    fn assign_row(&mut self, var: &str, row: usize, values: &[f64]) -> Result<(), EngineError>;

    fn assign_names(&mut self, var: &str, axis: NameAxis, names: &[String]) -> Result<(), EngineError>;

    fn eval(&mut self, request: &EngineRequest) -> Result<EngineValue, EngineError>;

    fn remove(&mut self, var: &str) -> Result<(), EngineError>;

    fn is_alive(&self) -> bool {
        true
    }
}

/// Establishes new engine sessions for the pool.
pub trait EngineConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError>;
}

#[derive(Debug, Clone)]
pub struct EnginePoolConfig {
    /// Maximum number of simultaneously open connections.
    pub capacity: usize,
}

impl Default for EnginePoolConfig {
    fn default() -> Self {
        Self { capacity: 4 }
    }
}

struct PoolState {
    idle: Vec<Box<dyn EngineConnection>>,
    open: usize,
    closed: bool,
}

/// Bounded pool of engine connections. Constructed once and shared by `Arc`;
/// [`EnginePool::shutdown`] ends its life.
pub struct EnginePool {
    connector: Arc<dyn EngineConnector>,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnginePool")
            .field("capacity", &self.capacity)
            .field("open", &self.open_count())
            .finish()
    }
}

impl EnginePool {
    pub fn new(connector: Arc<dyn EngineConnector>, config: EnginePoolConfig) -> Self {
        let capacity = config.capacity.max(1);
        info!("Creating engine connection pool with capacity {}", capacity);
        Self {
            connector,
            capacity,
            state: Mutex::new(PoolState { idle: Vec::new(), open: 0, closed: false }),
            available: Condvar::new(),
        }
    }

    /// Pool backed by in-process [`EmbeddedEngine`]s.
    pub fn embedded(config: EnginePoolConfig) -> Self {
        Self::new(Arc::new(EmbeddedConnector), config)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Connections currently established (idle or borrowed).
    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).open
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).idle.len()
    }

    /// Borrows a connection, blocking while all `capacity` connections are in use.
    pub fn borrow_connection(&self) -> Result<PooledConnection<'_>, EngineError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if state.closed {
                return Err(EngineError::PoolClosed);
            }
            if let Some(conn) = state.idle.pop() {
                trace!("Borrowed idle engine connection");
                return Ok(PooledConnection { pool: self, conn: Some(conn), broken: false });
            }
            if state.open < self.capacity {
                state.open += 1;
                drop(state);
                return match self.connector.connect() {
                    Ok(conn) => {
                        debug!("Opened new engine connection");
                        Ok(PooledConnection { pool: self, conn: Some(conn), broken: false })
                    }
                    Err(e) => {
                        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                        state.open -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }
            state = self.available.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn return_connection(&self, conn: Box<dyn EngineConnection>, broken: bool) {
        let replacement = if broken || !conn.is_alive() {
            drop(conn);
            warn!("Discarding broken engine connection and re-establishing it");
            match self.connector.connect() {
                Ok(fresh) => Some(fresh),
                Err(e) => {
                    warn!("Could not re-establish engine connection: {}", e);
                    None
                }
            }
        } else {
            Some(conn)
        };

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match replacement {
            Some(conn) if !state.closed => state.idle.push(conn),
            _ => state.open -= 1,
        }
        self.available.notify_one();
    }

    /// Closes idle connections and refuses further borrows. Borrowed connections
    /// are closed as they come back.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        let idle = state.idle.len();
        state.idle.clear();
        state.open -= idle;
        info!("Engine pool shut down ({} idle connections closed)", idle);
        self.available.notify_all();
    }
}

/// A borrowed connection; returned to its pool on drop.
pub struct PooledConnection<'a> {
    pool: &'a EnginePool,
    conn: Option<Box<dyn EngineConnection>>,
    broken: bool,
}

impl PooledConnection<'_> {
    /// Marks the connection broken so the pool re-establishes it instead of reusing it.
    pub fn invalidate(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledConnection<'_> {
    type Target = dyn EngineConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("pooled connection is present until drop")
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("pooled connection is present until drop")
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn, self.broken);
        }
    }
}

#[derive(Debug, Clone)]
struct WorkspaceMatrix {
    data: Array2<f64>,
    row_names: Option<Vec<String>>,
    col_names: Option<Vec<String>>,
}

/// In-process engine: a private workspace of named matrices plus `prcomp` and `svd`.
#[derive(Debug, Default)]
pub struct EmbeddedEngine {
    workspace: HashMap<String, WorkspaceMatrix>,
}

impl EmbeddedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn variable(&self, var: &str) -> Result<&WorkspaceMatrix, EngineError> {
        self.workspace
            .get(var)
            .ok_or_else(|| EngineError::UnknownVariable(var.to_string()))
    }

    fn eval_prcomp(
        &self,
        request: &EngineRequest,
        var: &str,
        options: &PrcompOptions,
        part: PrcompPart,
    ) -> Result<EngineValue, EngineError> {
        let matrix = self.variable(var)?;
        let evaluate = || {
            prcomp(matrix.data.view(), options).map_err(|e| EngineError::Evaluation {
                expression: request.to_string(),
                reason: e.to_string(),
            })
        };
        match part {
            // Rotation rows are the input's columns.
            PrcompPart::RotationRowNames => Ok(EngineValue::Strings(matrix.col_names.clone().unwrap_or_default())),
            PrcompPart::Rotation => Ok(EngineValue::from_matrix(&evaluate()?.rotation)),
            PrcompPart::Sdev => Ok(EngineValue::vector(evaluate()?.sdev.to_vec())),
        }
    }

    fn eval_svd(
        &self,
        request: &EngineRequest,
        var: &str,
        nu: usize,
        nv: usize,
        part: SvdPart,
    ) -> Result<EngineValue, EngineError> {
        let matrix = self.variable(var)?;
        let (nrow, ncol) = matrix.data.dim();
        let evaluation_error = |reason: String| EngineError::Evaluation {
            expression: request.to_string(),
            reason,
        };
        if nu > nrow || nv > ncol {
            return Err(evaluation_error(format!(
                "nu={} / nv={} exceed the {}x{} matrix",
                nu, nv, nrow, ncol
            )));
        }
        let output = LinAlgBackendProvider::new()
            .svd_into(matrix.data.clone(), part == SvdPart::U, part == SvdPart::V)
            .map_err(|e| evaluation_error(e.to_string()))?;
        match part {
            SvdPart::D => Ok(EngineValue::vector(output.s.to_vec())),
            SvdPart::U => {
                let u = output.u.ok_or_else(|| evaluation_error("u not computed".to_string()))?;
                Ok(EngineValue::from_matrix(&u.slice(s![.., ..nu]).to_owned()))
            }
            SvdPart::V => {
                let vt = output.vt.ok_or_else(|| evaluation_error("v not computed".to_string()))?;
                Ok(EngineValue::from_matrix(&vt.slice(s![..nv, ..]).t().to_owned()))
            }
        }
    }
}

impl EngineConnection for EmbeddedEngine {
    fn create_matrix(&mut self, var: &str, nrow: usize, ncol: usize) -> Result<(), EngineError> {
        self.workspace.insert(
            var.to_string(),
            WorkspaceMatrix { data: Array2::zeros((nrow, ncol)), row_names: None, col_names: None },
        );
        Ok(())
    }

    fn assign_row(&mut self, var: &str, row: usize, values: &[f64]) -> Result<(), EngineError> {
        let matrix = self
            .workspace
            .get_mut(var)
            .ok_or_else(|| EngineError::UnknownVariable(var.to_string()))?;
        let (nrow, ncol) = matrix.data.dim();
        if row >= nrow || values.len() != ncol {
            return Err(EngineError::Evaluation {
                expression: format!("{}[{},] <- c(...)", var, row + 1),
                reason: format!("{} values for row {} of a {}x{} matrix", values.len(), row + 1, nrow, ncol),
            });
        }
        for (cell, value) in matrix.data.row_mut(row).iter_mut().zip(values) {
            *cell = *value;
        }
        Ok(())
    }

    fn assign_names(&mut self, var: &str, axis: NameAxis, names: &[String]) -> Result<(), EngineError> {
        let matrix = self
            .workspace
            .get_mut(var)
            .ok_or_else(|| EngineError::UnknownVariable(var.to_string()))?;
        let expected = match axis {
            NameAxis::Rows => matrix.data.nrows(),
            NameAxis::Columns => matrix.data.ncols(),
        };
        if names.len() != expected {
            return Err(EngineError::Evaluation {
                expression: format!("dimnames({})", var),
                reason: format!("{} names for a dimension of length {}", names.len(), expected),
            });
        }
        match axis {
            NameAxis::Rows => matrix.row_names = Some(names.to_vec()),
            NameAxis::Columns => matrix.col_names = Some(names.to_vec()),
        }
        Ok(())
    }

    fn eval(&mut self, request: &EngineRequest) -> Result<EngineValue, EngineError> {
        trace!("eval: {}", request);
        match request {
            EngineRequest::Prcomp { var, options, part } => self.eval_prcomp(request, var, options, *part),
            EngineRequest::Svd { var, nu, nv, part } => self.eval_svd(request, var, *nu, *nv, *part),
        }
    }

    fn remove(&mut self, var: &str) -> Result<(), EngineError> {
        self.workspace.remove(var);
        Ok(())
    }
}

/// Connector producing [`EmbeddedEngine`] sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedConnector;

impl EngineConnector for EmbeddedConnector {
    fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError> {
        Ok(Box::new(EmbeddedEngine::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct CountingConnector {
        connects: AtomicUsize,
    }

    impl EngineConnector for CountingConnector {
        fn connect(&self) -> Result<Box<dyn EngineConnection>, EngineError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(EmbeddedEngine::new()))
        }
    }

    #[test]
    fn request_renders_as_expression() {
        let request = EngineRequest::Prcomp {
            var: "x".to_string(),
            options: PrcompOptions { center: true, scale: false, tol: Some(0.05) },
            part: PrcompPart::Rotation,
        };
        assert_eq!(request.to_string(), "prcomp(x, center=TRUE, scale.=FALSE, tol=0.05)$rotation");
        let svd = EngineRequest::Svd { var: "m".to_string(), nu: 2, nv: 0, part: SvdPart::U };
        assert_eq!(svd.to_string(), "svd(m, nu=2, nv=0)$u");
    }

    #[test]
    fn de_flattening_honours_layout() {
        let column_major = EngineValue::Numeric {
            values: vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0],
            nrow: 2,
            ncol: 3,
            layout: Layout::ColumnMajor,
        };
        let row_major = EngineValue::Numeric {
            values: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            nrow: 2,
            ncol: 3,
            layout: Layout::RowMajor,
        };
        let expected = ndarray::array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        assert_eq!(column_major.into_matrix().unwrap(), expected);
        assert_eq!(row_major.into_matrix().unwrap(), expected);

        let short = EngineValue::Numeric { values: vec![1.0], nrow: 2, ncol: 2, layout: Layout::RowMajor };
        assert!(matches!(short.into_matrix(), Err(EngineError::MalformedReply(_))));
    }

    #[test]
    fn embedded_engine_rejects_bad_rows_and_unknown_variables() {
        let mut engine = EmbeddedEngine::new();
        engine.create_matrix("x", 2, 2).unwrap();
        assert!(engine.assign_row("x", 2, &[1.0, 2.0]).is_err());
        assert!(engine.assign_row("x", 0, &[1.0]).is_err());
        assert!(matches!(
            engine.assign_row("y", 0, &[1.0, 2.0]),
            Err(EngineError::UnknownVariable(_))
        ));
    }

    #[test]
    fn embedded_prcomp_answers_each_part() {
        let mut engine = EmbeddedEngine::new();
        engine.create_matrix("x", 4, 2).unwrap();
        for (row, values) in [[1.0, 2.0], [2.0, 1.0], [3.0, 4.0], [4.0, 3.0]].iter().enumerate() {
            engine.assign_row("x", row, values).unwrap();
        }
        let features = vec!["g1".to_string(), "g2".to_string()];
        engine.assign_names("x", NameAxis::Columns, &features).unwrap();
        let request = |part| EngineRequest::Prcomp { var: "x".to_string(), options: PrcompOptions::default(), part };

        let names = engine.eval(&request(PrcompPart::RotationRowNames)).unwrap().into_strings().unwrap();
        assert_eq!(names, features);
        let rotation = engine.eval(&request(PrcompPart::Rotation)).unwrap().into_matrix().unwrap();
        assert_eq!(rotation.dim(), (2, 2));
        let sdev = engine.eval(&request(PrcompPart::Sdev)).unwrap().into_vector().unwrap();
        assert_eq!(sdev.len(), 2);
        assert!(sdev[0] >= sdev[1]);
    }

    #[test]
    fn invalidated_connection_is_re_established() {
        let connector = Arc::new(CountingConnector { connects: AtomicUsize::new(0) });
        let pool = EnginePool::new(connector.clone(), EnginePoolConfig { capacity: 1 });
        {
            let mut conn = pool.borrow_connection().unwrap();
            conn.invalidate();
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(pool.open_count(), 1);
        assert_eq!(pool.idle_count(), 1);
        {
            let _conn = pool.borrow_connection().unwrap();
        }
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn borrow_blocks_until_a_connection_is_returned() {
        let pool = Arc::new(EnginePool::embedded(EnginePoolConfig { capacity: 1 }));
        let held = pool.borrow_connection().unwrap();

        let waiter_pool = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            let _conn = waiter_pool.borrow_connection().unwrap();
            true
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(held);
        assert!(waiter.join().unwrap());
        assert_eq!(pool.open_count(), 1);
    }

    #[test]
    fn shutdown_refuses_new_borrows() {
        let pool = EnginePool::embedded(EnginePoolConfig::default());
        drop(pool.borrow_connection().unwrap());
        pool.shutdown();
        assert_eq!(pool.open_count(), 0);
        assert!(matches!(pool.borrow_connection(), Err(EngineError::PoolClosed)));
    }
}
