//! Host-memory compute device.
//!
//! [`HostDevice`] stands in for a GPU: buffers are plain vectors, and every
//! allocation and release is recorded in an [`AllocationLedger`]. The ledger
//! can be told to fail a chosen allocation, which makes the cleanup paths of
//! the solver observable in tests.
//!
//! The Cholesky primitive mirrors the GPU one: it reads the lower triangle of
//! a CSR matrix, factors it with faer's simplicial `L Lᵀ` in natural order
//! (no fill-reducing permutation) and reports the first pivot that falls to
//! the tolerance or below.

use std::mem::size_of;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError};

use faer::dyn_stack::{MemBuffer, MemStack};
use faer::linalg::cholesky::llt::factor::LltError;
use faer::sparse::linalg::SupernodalThreshold;
use faer::sparse::linalg::cholesky::{
    CholeskySymbolicParams, LltRef, SymbolicCholesky, SymbolicCholeskyRaw, SymmetricOrdering,
    factorize_symbolic_cholesky,
};
use faer::sparse::{SparseColMat, Triplet};
use faer::{Conj, MatMut, Par, Side};
use tracing::{debug, trace};

use super::{ComputeDevice, DeviceBuffer, DeviceCsrMatrix, DeviceScalar};
use crate::linalg::{LinAlgError, LinAlgResult, SparseMatrix};

/// Name under which the host kernel reports status codes
const KERNEL: &str = "host_csrlsvchol";

/// Status reported when the kernel cannot get working memory
const STATUS_ALLOC_FAILED: i32 = 2;

/// Status reported by the host kernel for malformed device arrays
const STATUS_INVALID_VALUE: i32 = 3;

const NO_SOLVE_FAILURE: i32 = 0;

const NO_FAILURE: usize = usize::MAX;

/// One entry of the allocation history
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    Allocated {
        id: usize,
        what: &'static str,
        bytes: usize,
    },
    Released {
        id: usize,
    },
}

/// Allocation bookkeeping shared by a device and all its buffers
#[derive(Debug)]
pub struct AllocationLedger {
    attempts: AtomicUsize,
    allocations: AtomicUsize,
    releases: AtomicUsize,
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    fail_at: AtomicUsize,
    fail_solve: AtomicI32,
    events: Mutex<Vec<LedgerEvent>>,
}

impl Default for AllocationLedger {
    fn default() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            allocations: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            peak_bytes: AtomicUsize::new(0),
            fail_at: AtomicUsize::new(NO_FAILURE),
            fail_solve: AtomicI32::new(NO_SOLVE_FAILURE),
            events: Mutex::new(Vec::new()),
        }
    }
}

impl AllocationLedger {
    /// Successful allocations so far
    pub fn allocations(&self) -> usize {
        self.allocations.load(AtomicOrdering::SeqCst)
    }

    /// Releases so far
    pub fn releases(&self) -> usize {
        self.releases.load(AtomicOrdering::SeqCst)
    }

    /// Allocations not yet released
    pub fn live(&self) -> usize {
        // A release may land between the two loads
        self.allocations().saturating_sub(self.releases())
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(AtomicOrdering::SeqCst)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak_bytes.load(AtomicOrdering::SeqCst)
    }

    /// Snapshot of the allocation history
    pub fn events(&self) -> Vec<LedgerEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make the `nth` allocation attempt from now (0-based) fail.
    pub fn fail_allocation_at(&self, nth: usize) {
        let attempts = self.attempts.load(AtomicOrdering::SeqCst);
        self.fail_at.store(attempts + nth, AtomicOrdering::SeqCst);
    }

    /// Make the next Cholesky call fail with the non-zero `status`.
    pub fn fail_solve_with(&self, status: i32) {
        self.fail_solve.store(status, AtomicOrdering::SeqCst);
    }

    /// Cancel pending injected failures.
    pub fn clear_failure(&self) {
        self.fail_at.store(NO_FAILURE, AtomicOrdering::SeqCst);
        self.fail_solve.store(NO_SOLVE_FAILURE, AtomicOrdering::SeqCst);
    }

    fn take_solve_failure(&self) -> Option<i32> {
        match self.fail_solve.swap(NO_SOLVE_FAILURE, AtomicOrdering::SeqCst) {
            NO_SOLVE_FAILURE => None,
            status => Some(status),
        }
    }

    fn record_allocation(&self, what: &'static str, bytes: usize) -> Result<usize, String> {
        let attempt = self.attempts.fetch_add(1, AtomicOrdering::SeqCst);
        if attempt == self.fail_at.load(AtomicOrdering::SeqCst) {
            return Err(format!("injected failure at allocation attempt {attempt}"));
        }

        let id = self.allocations.fetch_add(1, AtomicOrdering::SeqCst);
        let live = self
            .live_bytes
            .fetch_add(bytes, AtomicOrdering::SeqCst)
            .saturating_add(bytes);
        self.peak_bytes.fetch_max(live, AtomicOrdering::SeqCst);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LedgerEvent::Allocated { id, what, bytes });
        Ok(id)
    }

    fn record_release(&self, id: usize, bytes: usize) {
        self.releases.fetch_add(1, AtomicOrdering::SeqCst);
        self.live_bytes.fetch_sub(bytes, AtomicOrdering::SeqCst);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LedgerEvent::Released { id });
    }
}

/// Vector-backed device buffer; its release is recorded on drop
#[derive(Debug)]
pub struct HostBuffer<T: DeviceScalar> {
    id: usize,
    data: Vec<T>,
    ledger: Arc<AllocationLedger>,
}

impl<T: DeviceScalar> HostBuffer<T> {
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    fn bytes(&self) -> usize {
        self.data.len() * size_of::<T>()
    }
}

impl<T: DeviceScalar> DeviceBuffer for HostBuffer<T> {
    fn len(&self) -> usize {
        self.data.len()
    }
}

impl<T: DeviceScalar> Drop for HostBuffer<T> {
    fn drop(&mut self) {
        trace!("Releasing host buffer {} ({} bytes)", self.id, self.bytes());
        self.ledger.record_release(self.id, self.bytes());
    }
}

/// Compute device backed by host memory
#[derive(Debug, Clone, Default)]
pub struct HostDevice {
    ledger: Arc<AllocationLedger>,
    memory_limit: Option<usize>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse allocations that would push live memory above `bytes`.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Allocation ledger shared with every buffer of this device
    pub fn ledger(&self) -> &Arc<AllocationLedger> {
        &self.ledger
    }
}

impl ComputeDevice for HostDevice {
    type Buffer<T: DeviceScalar> = HostBuffer<T>;

    fn name(&self) -> &str {
        "host"
    }

    fn ensure_available(&self) -> LinAlgResult<()> {
        Ok(())
    }

    fn alloc<T: DeviceScalar>(
        &self,
        len: usize,
        what: &'static str,
    ) -> LinAlgResult<Self::Buffer<T>> {
        let bytes = len.checked_mul(size_of::<T>()).ok_or_else(|| {
            LinAlgError::ResourceExhausted {
                what,
                bytes: usize::MAX,
                reason: format!("{len} x {} overflows the address space", T::NAME),
            }
        })?;

        if let Some(limit) = self.memory_limit {
            let live = self.ledger.live_bytes();
            if live.checked_add(bytes).is_none_or(|total| total > limit) {
                return Err(LinAlgError::ResourceExhausted {
                    what,
                    bytes,
                    reason: format!("{live} of {limit} bytes already in use"),
                });
            }
        }

        let id = self
            .ledger
            .record_allocation(what, bytes)
            .map_err(|reason| LinAlgError::ResourceExhausted {
                what,
                bytes,
                reason,
            })?;
        trace!("Allocated host buffer {} for {} ({} bytes)", id, what, bytes);

        Ok(HostBuffer {
            id,
            data: vec![T::default(); len],
            ledger: Arc::clone(&self.ledger),
        })
    }

    fn copy_to_device<T: DeviceScalar>(
        &self,
        dst: &mut Self::Buffer<T>,
        src: &[T],
    ) -> LinAlgResult<()> {
        if dst.data.len() != src.len() {
            return Err(LinAlgError::InvalidInput(format!(
                "Copy of {} elements into a buffer of {}",
                src.len(),
                dst.data.len()
            )));
        }
        dst.data.copy_from_slice(src);
        Ok(())
    }

    fn copy_to_host<T: DeviceScalar>(
        &self,
        src: &Self::Buffer<T>,
        dst: &mut [T],
    ) -> LinAlgResult<()> {
        if dst.len() != src.data.len() {
            return Err(LinAlgError::InvalidInput(format!(
                "Copy of {} elements into a host slice of {}",
                src.data.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(&src.data);
        Ok(())
    }

    fn sparse_cholesky_solve(
        &self,
        matrix: &DeviceCsrMatrix<Self>,
        rhs: &Self::Buffer<f64>,
        x: &mut Self::Buffer<f64>,
        tolerance: f64,
    ) -> LinAlgResult<Option<usize>> {
        if let Some(status) = self.ledger.take_solve_failure() {
            return Err(LinAlgError::backend(KERNEL, status));
        }

        let lower = LowerCsr::new(
            matrix.dim(),
            matrix.row_ptr().as_slice(),
            matrix.col_idx().as_slice(),
            matrix.values().as_slice(),
        )
        .ok_or_else(|| LinAlgError::backend(KERNEL, STATUS_INVALID_VALUE))?;

        if rhs.data.len() != lower.dim || x.data.len() != lower.dim {
            return Err(LinAlgError::backend(KERNEL, STATUS_INVALID_VALUE));
        }
        if lower.dim == 0 {
            return Ok(None);
        }

        let upper = lower
            .to_upper_csc()
            .ok_or_else(|| LinAlgError::backend(KERNEL, STATUS_INVALID_VALUE))?;

        match NaturalCholesky::factor(&upper, tolerance)? {
            Ok(factor) => {
                debug!(
                    "Host Cholesky: {} columns, {} factor entries",
                    lower.dim,
                    factor.nnz()
                );
                x.data.copy_from_slice(&rhs.data);
                factor.solve_in_place(&mut x.data)?;
                Ok(None)
            }
            Err(pivot) => Ok(Some(pivot)),
        }
    }
}

/// Validated view of a lower-triangular CSR matrix with `usize` indices
struct LowerCsr<'a> {
    dim: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: &'a [f64],
}

impl<'a> LowerCsr<'a> {
    /// `None` if the arrays do not describe a `dim × dim` CSR matrix.
    fn new(dim: usize, row_ptr: &[i32], col_idx: &[i32], values: &'a [f64]) -> Option<Self> {
        if row_ptr.len() != dim + 1 || col_idx.len() != values.len() {
            return None;
        }
        let row_ptr: Vec<usize> = row_ptr
            .iter()
            .map(|&p| usize::try_from(p).ok())
            .collect::<Option<_>>()?;
        let col_idx: Vec<usize> = col_idx
            .iter()
            .map(|&c| usize::try_from(c).ok().filter(|&c| c < dim))
            .collect::<Option<_>>()?;

        if row_ptr.first() != Some(&0)
            || row_ptr.last() != Some(&values.len())
            || row_ptr.windows(2).any(|w| w[0] > w[1])
        {
            return None;
        }

        Some(Self {
            dim,
            row_ptr,
            col_idx,
            values,
        })
    }

    /// The same arrays read as the upper triangle in compressed-column form.
    ///
    /// Row `k` of the lower CSR matrix is column `k` of the upper CSC one.
    /// Entries above the diagonal of the lower view are dropped.
    fn to_upper_csc(&self) -> Option<SparseMatrix> {
        let mut triplets = Vec::with_capacity(self.values.len());
        for k in 0..self.dim {
            for p in self.row_ptr[k]..self.row_ptr[k + 1] {
                if self.col_idx[p] <= k {
                    triplets.push(Triplet::new(self.col_idx[p], k, self.values[p]));
                }
            }
        }
        SparseColMat::try_new_from_triplets(self.dim, self.dim, &triplets).ok()
    }
}

/// Simplicial `M = L Lᵀ` without fill-reducing permutation
struct NaturalCholesky {
    symbolic: SymbolicCholesky<usize>,
    l_values: Vec<f64>,
}

impl NaturalCholesky {
    /// Factor the symmetric matrix whose upper triangle is `upper`.
    ///
    /// The inner `Err(k)` is the first column whose pivot `sqrt(d)` is not
    /// above `tolerance`, including pivots with `d <= 0`.
    fn factor(upper: &SparseMatrix, tolerance: f64) -> LinAlgResult<Result<Self, usize>> {
        let params = CholeskySymbolicParams {
            supernodal_flop_ratio_threshold: SupernodalThreshold::FORCE_SIMPLICIAL,
            ..Default::default()
        };
        let symbolic = factorize_symbolic_cholesky(
            upper.symbolic(),
            Side::Upper,
            SymmetricOrdering::Identity,
            params,
        )
        .map_err(|_| LinAlgError::backend(KERNEL, STATUS_ALLOC_FAILED))?;

        let mut l_values = vec![0.0; symbolic.len_val()];
        let mut scratch = MemBuffer::try_new(
            symbolic.factorize_numeric_llt_scratch::<f64>(Par::Seq, Default::default()),
        )
        .map_err(|_| LinAlgError::backend(KERNEL, STATUS_ALLOC_FAILED))?;

        let non_positive = match symbolic.factorize_numeric_llt(
            &mut l_values,
            upper.as_ref(),
            Side::Upper,
            Default::default(),
            Par::Seq,
            MemStack::new(&mut scratch),
            Default::default(),
        ) {
            Ok(_) => None,
            // faer counts simplicial pivots from one
            Err(LltError::NonPositivePivot { index }) => Some(index.saturating_sub(1)),
        };

        let SymbolicCholeskyRaw::Simplicial(simplicial) = symbolic.raw() else {
            return Err(LinAlgError::backend(KERNEL, STATUS_INVALID_VALUE));
        };
        // Each column of L starts with its diagonal entry
        let col_ptr = simplicial.col_ptr();
        let factored = non_positive.unwrap_or(upper.ncols());
        if let Some(k) = (0..factored).find(|&k| l_values[col_ptr[k]] <= tolerance) {
            return Ok(Err(k));
        }
        if let Some(k) = non_positive {
            return Ok(Err(k));
        }

        Ok(Ok(Self { symbolic, l_values }))
    }

    fn nnz(&self) -> usize {
        self.l_values.len()
    }

    /// Overwrite `b` with the solution of `L Lᵀ x = b`.
    fn solve_in_place(&self, b: &mut [f64]) -> LinAlgResult<()> {
        let n = b.len();
        let mut scratch = MemBuffer::try_new(self.symbolic.solve_in_place_scratch::<f64>(1, Par::Seq))
            .map_err(|_| LinAlgError::backend(KERNEL, STATUS_ALLOC_FAILED))?;
        LltRef::new(&self.symbolic, &self.l_values).solve_in_place_with_conj(
            Conj::No,
            MatMut::from_column_major_slice_mut(b, n, 1),
            Par::Seq,
            MemStack::new(&mut scratch),
        );
        Ok(())
    }
}
