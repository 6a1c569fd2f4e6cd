//! Compute devices and device-resident sparse systems.
//!
//! A [`ComputeDevice`] owns memory through RAII buffers: a buffer is released
//! when it is dropped, so every allocation made during a solve is freed on
//! every exit path, including errors raised halfway through an upload.
//!
//! Two devices are provided:
//! - [`CudaDevice`]: cudart + cuSOLVER sparse, loaded at runtime
//! - [`HostDevice`]: device memory emulated in host vectors, with an
//!   allocation ledger and failure injection
//!
//! # Storage convention
//!
//! `AᵀA` is kept as the upper triangle in compressed-column form. Those three
//! arrays are, unchanged, the lower triangle of the same symmetric matrix in
//! compressed-row form, which is what the Cholesky primitive reads. No
//! reordering is performed on the device; the caller's variable ordering is
//! the elimination order.

use tracing::{debug, warn};

use crate::linalg::{LinAlgError, LinAlgResult, SparseMatrix};

pub mod cuda;
pub mod host;

pub use cuda::CudaDevice;
pub use host::{AllocationLedger, HostDevice, LedgerEvent};

/// Element types that can live in device memory
pub trait DeviceScalar: Copy + Default + Send + Sync + 'static {
    const NAME: &'static str;
}

impl DeviceScalar for i32 {
    const NAME: &'static str = "i32";
}

impl DeviceScalar for f64 {
    const NAME: &'static str = "f64";
}

/// Owned device allocation, released on drop
pub trait DeviceBuffer {
    /// Number of elements
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Memory management and the sparse Cholesky primitive of one device.
///
/// Implementations must be usable from several threads at once; buffers are
/// never shared between solves.
pub trait ComputeDevice: Send + Sync + Sized {
    /// Device allocation holding `T`s
    type Buffer<T: DeviceScalar>: DeviceBuffer;

    /// Human-readable device name for logs
    fn name(&self) -> &str;

    /// Fail with [`LinAlgError::BackendUnavailable`] if the device cannot be used.
    fn ensure_available(&self) -> LinAlgResult<()>;

    /// Allocate `len` elements.
    ///
    /// # Errors
    /// [`LinAlgError::ResourceExhausted`] when the allocation cannot be satisfied.
    fn alloc<T: DeviceScalar>(&self, len: usize, what: &'static str)
    -> LinAlgResult<Self::Buffer<T>>;

    /// Copy `src` into `dst`; lengths must match.
    fn copy_to_device<T: DeviceScalar>(
        &self,
        dst: &mut Self::Buffer<T>,
        src: &[T],
    ) -> LinAlgResult<()>;

    /// Copy `src` into `dst`; lengths must match.
    fn copy_to_host<T: DeviceScalar>(&self, src: &Self::Buffer<T>, dst: &mut [T])
    -> LinAlgResult<()>;

    /// Solve `M x = rhs` by Cholesky, reading the lower triangle of `matrix`.
    ///
    /// Returns `None` when the factorization succeeded, or `Some(pivot)` with
    /// the first pivot whose magnitude fell to `tolerance` or below, in which
    /// case `x` is unspecified.
    fn sparse_cholesky_solve(
        &self,
        matrix: &DeviceCsrMatrix<Self>,
        rhs: &Self::Buffer<f64>,
        x: &mut Self::Buffer<f64>,
        tolerance: f64,
    ) -> LinAlgResult<Option<usize>>;
}

/// Symmetric sparse matrix resident on a device (lower triangle, CSR)
pub struct DeviceCsrMatrix<D: ComputeDevice> {
    dim: usize,
    nnz: usize,
    row_ptr: D::Buffer<i32>,
    col_idx: D::Buffer<i32>,
    values: D::Buffer<f64>,
}

impl<D: ComputeDevice> DeviceCsrMatrix<D> {
    /// Upload the upper-triangular compressed-column `upper`.
    ///
    /// Exactly three arrays are transferred, in this order: outer index
    /// (`n + 1`), inner index (`nnz`) and values (`nnz`). If any allocation
    /// or copy fails, the arrays already on the device are released before
    /// the error is returned.
    ///
    /// # Errors
    /// [`LinAlgError::InvalidInput`] if the matrix is not square or its
    /// indices do not fit in `i32`; device errors otherwise.
    pub fn upload(device: &D, upper: &SparseMatrix) -> LinAlgResult<Self> {
        let dim = upper.nrows();
        if upper.ncols() != dim {
            return Err(LinAlgError::InvalidInput(format!(
                "Normal-equations matrix must be square, got {} x {}",
                upper.nrows(),
                upper.ncols()
            )));
        }

        let symbolic = upper.symbolic();
        let mut outer = Vec::with_capacity(dim + 1);
        let mut inner = Vec::new();
        let mut values = Vec::new();
        outer.push(0);
        for col in 0..dim {
            for &row in symbolic.row_idx_of_col_raw(col) {
                inner.push(to_index(row)?);
            }
            values.extend_from_slice(upper.val_of_col(col));
            outer.push(to_index(inner.len())?);
        }
        let nnz = inner.len();

        debug!(
            "Uploading {}x{} matrix with {} entries to {}",
            dim,
            dim,
            nnz,
            device.name()
        );

        let row_ptr = upload_slice(device, &outer, "row pointers")?;
        let col_idx = upload_slice(device, &inner, "column indices")?;
        let values = upload_slice(device, &values, "values")?;

        Ok(Self {
            dim,
            nnz,
            row_ptr,
            col_idx,
            values,
        })
    }

    /// Matrix dimension
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Number of stored entries
    pub fn nnz(&self) -> usize {
        self.nnz
    }

    pub fn row_ptr(&self) -> &D::Buffer<i32> {
        &self.row_ptr
    }

    pub fn col_idx(&self) -> &D::Buffer<i32> {
        &self.col_idx
    }

    pub fn values(&self) -> &D::Buffer<f64> {
        &self.values
    }
}

fn to_index(value: usize) -> LinAlgResult<i32> {
    i32::try_from(value).map_err(|_| {
        LinAlgError::InvalidInput(format!("Index {value} does not fit the 32-bit device format"))
    })
}

/// Allocate a buffer and fill it from `host`.
pub fn upload_slice<D: ComputeDevice, T: DeviceScalar>(
    device: &D,
    host: &[T],
    what: &'static str,
) -> LinAlgResult<D::Buffer<T>> {
    let mut buffer = device.alloc::<T>(host.len(), what)?;
    device.copy_to_device(&mut buffer, host)?;
    Ok(buffer)
}

/// Copy a whole buffer back to host memory.
pub fn download_slice<D: ComputeDevice, T: DeviceScalar>(
    device: &D,
    buffer: &D::Buffer<T>,
) -> LinAlgResult<Vec<T>> {
    let mut host = vec![T::default(); buffer.len()];
    device.copy_to_host(buffer, &mut host)?;
    Ok(host)
}

/// Run the Cholesky primitive on device data and bring the solution home.
///
/// The solution buffer is allocated here and released before returning. A
/// reported singularity is fatal: no partial solution is returned.
///
/// # Errors
/// [`LinAlgError::NumericalSingularity`] if the primitive reports a pivot,
/// and any device error from allocation, the primitive or the download.
pub fn solve_on_device<D: ComputeDevice>(
    device: &D,
    matrix: &DeviceCsrMatrix<D>,
    rhs: &D::Buffer<f64>,
    tolerance: f64,
) -> LinAlgResult<Vec<f64>> {
    if rhs.len() != matrix.dim() {
        return Err(LinAlgError::InvalidInput(format!(
            "Right-hand side has {} entries, matrix is {}x{}",
            rhs.len(),
            matrix.dim(),
            matrix.dim()
        )));
    }

    let mut x = device.alloc::<f64>(matrix.dim(), "solution")?;
    let singularity = device.sparse_cholesky_solve(matrix, rhs, &mut x, tolerance)?;
    let solution = download_slice(device, &x)?;

    if let Some(pivot) = singularity {
        warn!(
            "Cholesky on {} hit a singular pivot at column {} (tolerance {:.1e})",
            device.name(),
            pivot,
            tolerance
        );
        return Err(LinAlgError::NumericalSingularity { pivot });
    }
    Ok(solution)
}
