//! CUDA compute device.
//!
//! The CUDA runtime, cuSPARSE and cuSOLVER are opened at runtime with
//! `libloading`, so this module always compiles and a binary built with the
//! `cuda` feature still starts on machines without a GPU. Without the
//! feature no library is ever opened and the device reports itself
//! unavailable.
//!
//! Device memory is owned by [`CudaBuffer`], which calls `cudaFree` on drop.
//! The cuSOLVER handle and the matrix descriptor live only for the duration
//! of one call and are destroyed the same way.

use std::ffi::{CStr, c_char, c_int, c_void};
use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr;

use libloading::Library;
use tracing::{debug, error};

use super::{ComputeDevice, DeviceBuffer, DeviceCsrMatrix, DeviceScalar};
use crate::linalg::{LinAlgError, LinAlgResult};

type CudaErrorT = c_int;
type CusolverStatusT = c_int;
type CusparseStatusT = c_int;
type CusolverSpHandleT = *mut c_void;
type CusparseMatDescrT = *mut c_void;

const CUDA_SUCCESS: CudaErrorT = 0;
const CUSOLVER_STATUS_SUCCESS: CusolverStatusT = 0;
const CUSPARSE_STATUS_SUCCESS: CusparseStatusT = 0;

const CUDA_MEMCPY_HOST_TO_DEVICE: c_int = 1;
const CUDA_MEMCPY_DEVICE_TO_HOST: c_int = 2;

const CUSPARSE_MATRIX_TYPE_GENERAL: c_int = 0;
const CUSPARSE_INDEX_BASE_ZERO: c_int = 0;

/// `reorder = 0`: factor in the given order
const NO_REORDER: c_int = 0;

type CudaSetDeviceFn = unsafe extern "C" fn(device: c_int) -> CudaErrorT;
type CudaMallocFn = unsafe extern "C" fn(ptr: *mut *mut c_void, size: usize) -> CudaErrorT;
type CudaFreeFn = unsafe extern "C" fn(ptr: *mut c_void) -> CudaErrorT;
type CudaMemcpyFn = unsafe extern "C" fn(
    dst: *mut c_void,
    src: *const c_void,
    count: usize,
    kind: c_int,
) -> CudaErrorT;
type CudaGetErrorStringFn = unsafe extern "C" fn(error: CudaErrorT) -> *const c_char;

type CusparseCreateMatDescrFn =
    unsafe extern "C" fn(descr: *mut CusparseMatDescrT) -> CusparseStatusT;
type CusparseDestroyMatDescrFn = unsafe extern "C" fn(descr: CusparseMatDescrT) -> CusparseStatusT;
type CusparseSetMatTypeFn =
    unsafe extern "C" fn(descr: CusparseMatDescrT, kind: c_int) -> CusparseStatusT;
type CusparseSetMatIndexBaseFn =
    unsafe extern "C" fn(descr: CusparseMatDescrT, base: c_int) -> CusparseStatusT;

type CusolverSpCreateFn = unsafe extern "C" fn(handle: *mut CusolverSpHandleT) -> CusolverStatusT;
type CusolverSpDestroyFn = unsafe extern "C" fn(handle: CusolverSpHandleT) -> CusolverStatusT;
type CusolverSpDcsrlsvcholFn = unsafe extern "C" fn(
    handle: CusolverSpHandleT,
    m: c_int,
    nnz: c_int,
    descr: CusparseMatDescrT,
    values: *const f64,
    row_ptr: *const c_int,
    col_idx: *const c_int,
    b: *const f64,
    tol: f64,
    reorder: c_int,
    x: *mut f64,
    singularity: *mut c_int,
) -> CusolverStatusT;

/// Function table of the three CUDA libraries
#[cfg_attr(not(feature = "cuda"), allow(dead_code))]
struct CudaLibraries {
    _cudart: Library,
    _cusparse: Library,
    _cusolver: Library,
    cuda_set_device: CudaSetDeviceFn,
    cuda_malloc: CudaMallocFn,
    cuda_free: CudaFreeFn,
    cuda_memcpy: CudaMemcpyFn,
    cuda_get_error_string: CudaGetErrorStringFn,
    cusparse_create_mat_descr: CusparseCreateMatDescrFn,
    cusparse_destroy_mat_descr: CusparseDestroyMatDescrFn,
    cusparse_set_mat_type: CusparseSetMatTypeFn,
    cusparse_set_mat_index_base: CusparseSetMatIndexBaseFn,
    cusolver_sp_create: CusolverSpCreateFn,
    cusolver_sp_destroy: CusolverSpDestroyFn,
    cusolver_sp_dcsrlsvchol: CusolverSpDcsrlsvcholFn,
}

// SAFETY: the tables hold plain function pointers into thread-safe libraries.
unsafe impl Send for CudaLibraries {}
unsafe impl Sync for CudaLibraries {}

#[cfg_attr(not(feature = "cuda"), allow(dead_code))]
impl CudaLibraries {
    fn load() -> Result<Self, String> {
        let cudart = load_library(&["libcudart.so.12", "libcudart.so.11", "libcudart.so"])?;
        let cusparse = load_library(&["libcusparse.so.12", "libcusparse.so.11", "libcusparse.so"])?;
        let cusolver = load_library(&["libcusolver.so.11", "libcusolver.so.10", "libcusolver.so"])?;

        // SAFETY: the signatures match the CUDA 11/12 C headers.
        unsafe {
            Ok(Self {
                cuda_set_device: symbol(&cudart, "cudaSetDevice")?,
                cuda_malloc: symbol(&cudart, "cudaMalloc")?,
                cuda_free: symbol(&cudart, "cudaFree")?,
                cuda_memcpy: symbol(&cudart, "cudaMemcpy")?,
                cuda_get_error_string: symbol(&cudart, "cudaGetErrorString")?,
                cusparse_create_mat_descr: symbol(&cusparse, "cusparseCreateMatDescr")?,
                cusparse_destroy_mat_descr: symbol(&cusparse, "cusparseDestroyMatDescr")?,
                cusparse_set_mat_type: symbol(&cusparse, "cusparseSetMatType")?,
                cusparse_set_mat_index_base: symbol(&cusparse, "cusparseSetMatIndexBase")?,
                cusolver_sp_create: symbol(&cusolver, "cusolverSpCreate")?,
                cusolver_sp_destroy: symbol(&cusolver, "cusolverSpDestroy")?,
                cusolver_sp_dcsrlsvchol: symbol(&cusolver, "cusolverSpDcsrlsvchol")?,
                _cudart: cudart,
                _cusparse: cusparse,
                _cusolver: cusolver,
            })
        }
    }

    fn error_string(&self, status: CudaErrorT) -> String {
        // SAFETY: cudaGetErrorString returns a static C string or null.
        unsafe {
            let message = (self.cuda_get_error_string)(status);
            if message.is_null() {
                format!("unknown CUDA error {status}")
            } else {
                CStr::from_ptr(message).to_string_lossy().into_owned()
            }
        }
    }
}

#[cfg_attr(not(feature = "cuda"), allow(dead_code))]
fn load_library(names: &[&str]) -> Result<Library, String> {
    let mut last_error = format!("no candidates for {names:?}");
    for name in names {
        // SAFETY: loading a CUDA library runs only its own initializers.
        match unsafe { Library::new(name) } {
            Ok(library) => return Ok(library),
            Err(e) => last_error = format!("{name}: {e}"),
        }
    }
    Err(last_error)
}

#[cfg_attr(not(feature = "cuda"), allow(dead_code))]
unsafe fn symbol<T: Copy + 'static>(library: &Library, name: &str) -> Result<T, String> {
    // SAFETY: forwarded to the caller, who guarantees `T` matches the symbol.
    unsafe { library.get::<T>(name.as_bytes()) }
        .map(|symbol| *symbol)
        .map_err(|e| format!("{name}: {e}"))
}

#[cfg(feature = "cuda")]
fn libraries() -> Result<&'static CudaLibraries, String> {
    use std::sync::OnceLock;

    static LIBRARIES: OnceLock<Result<CudaLibraries, String>> = OnceLock::new();
    LIBRARIES
        .get_or_init(CudaLibraries::load)
        .as_ref()
        .map_err(Clone::clone)
}

#[cfg(not(feature = "cuda"))]
fn libraries() -> Result<&'static CudaLibraries, String> {
    Err("built without the `cuda` feature".to_string())
}

#[track_caller]
fn check_cuda(
    libs: &CudaLibraries,
    call: &'static str,
    status: CudaErrorT,
) -> LinAlgResult<()> {
    if status == CUDA_SUCCESS {
        Ok(())
    } else {
        error!("{} failed: {}", call, libs.error_string(status));
        Err(LinAlgError::backend(call, status))
    }
}

#[track_caller]
fn check_status(call: &'static str, status: c_int, success: c_int) -> LinAlgResult<()> {
    if status == success {
        Ok(())
    } else {
        Err(LinAlgError::backend(call, status))
    }
}

/// Device allocation released with `cudaFree` on drop
pub struct CudaBuffer<T: DeviceScalar> {
    ptr: *mut c_void,
    len: usize,
    libs: &'static CudaLibraries,
    _marker: PhantomData<T>,
}

// SAFETY: the pointer is device memory owned exclusively by this buffer.
unsafe impl<T: DeviceScalar> Send for CudaBuffer<T> {}
unsafe impl<T: DeviceScalar> Sync for CudaBuffer<T> {}

impl<T: DeviceScalar> CudaBuffer<T> {
    fn bytes(&self) -> usize {
        self.len * size_of::<T>()
    }

    fn as_ptr<U>(&self) -> *const U {
        self.ptr as *const U
    }

    fn as_mut_ptr<U>(&mut self) -> *mut U {
        self.ptr as *mut U
    }
}

impl<T: DeviceScalar> DeviceBuffer for CudaBuffer<T> {
    fn len(&self) -> usize {
        self.len
    }
}

impl<T: DeviceScalar> Drop for CudaBuffer<T> {
    fn drop(&mut self) {
        if self.ptr.is_null() {
            return;
        }
        // SAFETY: `ptr` came from cudaMalloc and is freed exactly once.
        let status = unsafe { (self.libs.cuda_free)(self.ptr) };
        if status != CUDA_SUCCESS {
            error!(
                "cudaFree of {} bytes failed: {}",
                self.bytes(),
                self.libs.error_string(status)
            );
        }
    }
}

/// cuSOLVER sparse handle, destroyed on drop
struct SolverHandle {
    raw: CusolverSpHandleT,
    libs: &'static CudaLibraries,
}

impl SolverHandle {
    fn new(libs: &'static CudaLibraries) -> LinAlgResult<Self> {
        let mut raw = ptr::null_mut();
        // SAFETY: `raw` is a valid out-pointer.
        let status = unsafe { (libs.cusolver_sp_create)(&mut raw) };
        check_status("cusolverSpCreate", status, CUSOLVER_STATUS_SUCCESS)?;
        Ok(Self { raw, libs })
    }
}

impl Drop for SolverHandle {
    fn drop(&mut self) {
        // SAFETY: created by cusolverSpCreate.
        unsafe {
            (self.libs.cusolver_sp_destroy)(self.raw);
        }
    }
}

/// General, zero-based cuSPARSE matrix descriptor, destroyed on drop
struct MatrixDescriptor {
    raw: CusparseMatDescrT,
    libs: &'static CudaLibraries,
}

impl MatrixDescriptor {
    fn general(libs: &'static CudaLibraries) -> LinAlgResult<Self> {
        let mut raw = ptr::null_mut();
        // SAFETY: `raw` is a valid out-pointer.
        let status = unsafe { (libs.cusparse_create_mat_descr)(&mut raw) };
        check_status("cusparseCreateMatDescr", status, CUSPARSE_STATUS_SUCCESS)?;
        let descriptor = Self { raw, libs };

        // SAFETY: `raw` is a live descriptor.
        let status = unsafe { (libs.cusparse_set_mat_type)(raw, CUSPARSE_MATRIX_TYPE_GENERAL) };
        check_status("cusparseSetMatType", status, CUSPARSE_STATUS_SUCCESS)?;
        let status = unsafe { (libs.cusparse_set_mat_index_base)(raw, CUSPARSE_INDEX_BASE_ZERO) };
        check_status("cusparseSetMatIndexBase", status, CUSPARSE_STATUS_SUCCESS)?;

        Ok(descriptor)
    }
}

impl Drop for MatrixDescriptor {
    fn drop(&mut self) {
        // SAFETY: created by cusparseCreateMatDescr.
        unsafe {
            (self.libs.cusparse_destroy_mat_descr)(self.raw);
        }
    }
}

/// NVIDIA GPU driven through cudart and cuSOLVER sparse
#[derive(Clone)]
pub struct CudaDevice {
    device_index: i32,
    name: String,
    libs: Result<&'static CudaLibraries, String>,
}

impl std::fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaDevice")
            .field("device_index", &self.device_index)
            .field("available", &self.libs.is_ok())
            .finish()
    }
}

impl Default for CudaDevice {
    fn default() -> Self {
        Self::new(0)
    }
}

impl CudaDevice {
    /// Bind to GPU `device_index`. Library loading happens here; failures
    /// are reported later by [`ComputeDevice::ensure_available`].
    pub fn new(device_index: i32) -> Self {
        let libs = libraries();
        if let Err(reason) = &libs {
            debug!("CUDA device {} unavailable: {}", device_index, reason);
        }
        Self {
            device_index,
            name: format!("cuda:{device_index}"),
            libs,
        }
    }

    pub fn device_index(&self) -> i32 {
        self.device_index
    }

    /// Whether the CUDA libraries were found
    pub fn is_available(&self) -> bool {
        self.libs.is_ok()
    }

    fn libs(&self) -> LinAlgResult<&'static CudaLibraries> {
        self.libs
            .as_ref()
            .copied()
            .map_err(|reason| LinAlgError::BackendUnavailable(reason.clone()))
    }
}

impl ComputeDevice for CudaDevice {
    type Buffer<T: DeviceScalar> = CudaBuffer<T>;

    fn name(&self) -> &str {
        &self.name
    }

    fn ensure_available(&self) -> LinAlgResult<()> {
        let libs = self.libs()?;
        // SAFETY: plain runtime call.
        let status = unsafe { (libs.cuda_set_device)(self.device_index) };
        if status != CUDA_SUCCESS {
            return Err(LinAlgError::BackendUnavailable(format!(
                "cudaSetDevice({}): {}",
                self.device_index,
                libs.error_string(status)
            )));
        }
        Ok(())
    }

    fn alloc<T: DeviceScalar>(
        &self,
        len: usize,
        what: &'static str,
    ) -> LinAlgResult<Self::Buffer<T>> {
        let libs = self.libs()?;
        let bytes = len.checked_mul(size_of::<T>()).ok_or_else(|| {
            LinAlgError::ResourceExhausted {
                what,
                bytes: usize::MAX,
                reason: format!("{len} x {} overflows the address space", T::NAME),
            }
        })?;

        let mut ptr = ptr::null_mut();
        if bytes > 0 {
            // SAFETY: `ptr` is a valid out-pointer.
            let status = unsafe { (libs.cuda_malloc)(&mut ptr, bytes) };
            if status != CUDA_SUCCESS {
                return Err(LinAlgError::ResourceExhausted {
                    what,
                    bytes,
                    reason: format!("cudaMalloc: {}", libs.error_string(status)),
                });
            }
        }

        Ok(CudaBuffer {
            ptr,
            len,
            libs,
            _marker: PhantomData,
        })
    }

    fn copy_to_device<T: DeviceScalar>(
        &self,
        dst: &mut Self::Buffer<T>,
        src: &[T],
    ) -> LinAlgResult<()> {
        if dst.len != src.len() {
            return Err(LinAlgError::InvalidInput(format!(
                "Copy of {} elements into a device buffer of {}",
                src.len(),
                dst.len
            )));
        }
        if dst.ptr.is_null() {
            return Ok(());
        }
        // SAFETY: both regions hold `len` elements of `T`.
        let status = unsafe {
            (dst.libs.cuda_memcpy)(
                dst.ptr,
                src.as_ptr().cast(),
                dst.bytes(),
                CUDA_MEMCPY_HOST_TO_DEVICE,
            )
        };
        check_cuda(dst.libs, "cudaMemcpy", status)
    }

    fn copy_to_host<T: DeviceScalar>(
        &self,
        src: &Self::Buffer<T>,
        dst: &mut [T],
    ) -> LinAlgResult<()> {
        if dst.len() != src.len {
            return Err(LinAlgError::InvalidInput(format!(
                "Copy of {} device elements into a host slice of {}",
                src.len,
                dst.len()
            )));
        }
        if src.ptr.is_null() {
            return Ok(());
        }
        // SAFETY: both regions hold `len` elements of `T`.
        let status = unsafe {
            (src.libs.cuda_memcpy)(
                dst.as_mut_ptr().cast(),
                src.ptr,
                src.bytes(),
                CUDA_MEMCPY_DEVICE_TO_HOST,
            )
        };
        check_cuda(src.libs, "cudaMemcpy", status)
    }

    fn sparse_cholesky_solve(
        &self,
        matrix: &DeviceCsrMatrix<Self>,
        rhs: &Self::Buffer<f64>,
        x: &mut Self::Buffer<f64>,
        tolerance: f64,
    ) -> LinAlgResult<Option<usize>> {
        let libs = self.libs()?;
        let to_int = |value: usize| {
            c_int::try_from(value).map_err(|_| {
                LinAlgError::InvalidInput(format!("{value} exceeds the cuSOLVER index range"))
            })
        };
        let m = to_int(matrix.dim())?;
        let nnz = to_int(matrix.nnz())?;

        let handle = SolverHandle::new(libs)?;
        let descriptor = MatrixDescriptor::general(libs)?;

        let mut singularity: c_int = -1;
        // SAFETY: all device pointers were allocated with the sizes implied by
        // `m` and `nnz`; `singularity` is a valid host out-pointer.
        let status = unsafe {
            (libs.cusolver_sp_dcsrlsvchol)(
                handle.raw,
                m,
                nnz,
                descriptor.raw,
                matrix.values().as_ptr(),
                matrix.row_ptr().as_ptr(),
                matrix.col_idx().as_ptr(),
                rhs.as_ptr(),
                tolerance,
                NO_REORDER,
                x.as_mut_ptr(),
                &mut singularity,
            )
        };
        check_status("cusolverSpDcsrlsvchol", status, CUSOLVER_STATUS_SUCCESS)?;

        debug!(
            "cusolverSpDcsrlsvchol on {}: n = {}, nnz = {}, singularity = {}",
            self.name, m, nnz, singularity
        );
        Ok(usize::try_from(singularity).ok())
    }
}
