use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::mem::{self, MaybeUninit};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::alloc::{self, Layout};

use static_assertions::const_assert_eq;

use crate::architecture::context;
use crate::runtime::{dispatcher, CACHE_LINE_SIZE, STACK_CANARY, UNOCCUPIED};
use crate::sync::{ConditionVariable, SpinLock};

/// Bytes available for the type-erased callable, leaving room for the wakeup
/// deadline on the same cache line.
pub const INVOCATION_SIZE: usize = CACHE_LINE_SIZE - mem::size_of::<u64>();

type ErasedInvoker = unsafe fn(*mut u8);

/// Runs the callable stored at `payload`, consuming it by value.
///
/// # Safety
///
/// `payload` must hold a valid, initialized `F` which is read exactly once.
unsafe fn invoke_erased<F: FnOnce()>(payload: *mut u8) {
    // SAFETY: Delegated to the caller.
    let callable = unsafe { payload.cast::<F>().read() };
    callable();
}

/// The inline storage a creator publishes a new thread through: the erased
/// invoker and its moved-in captures, co-located with the wakeup deadline so
/// that creation touches a single cache line.
#[repr(C, align(64))]
pub(crate) struct InvocationSlot {
    data: UnsafeCell<[MaybeUninit<u8>; INVOCATION_SIZE]>,
    /// The minimum cycle-counter value at which the hosted thread may run.
    /// `0` means runnable immediately, `BLOCKED` means parked until
    /// signaled, `UNOCCUPIED` means no live thread lives here.
    pub wakeup_time_in_cycles: AtomicU64,
}

const_assert_eq!(mem::size_of::<InvocationSlot>(), CACHE_LINE_SIZE);

impl InvocationSlot {
    fn new() -> Self {
        Self {
            data: UnsafeCell::new([MaybeUninit::uninit(); INVOCATION_SIZE]),
            wakeup_time_in_cycles: AtomicU64::new(UNOCCUPIED),
        }
    }

    /// Moves `f` and its erased invoker into the buffer.
    ///
    /// # Safety
    ///
    /// The caller must hold the slot reservation (occupancy bit set, wakeup
    /// not yet published), so no other party touches the buffer.
    pub unsafe fn store<F: FnOnce() + Send>(&self, f: F) {
        const {
            assert!(
                mem::size_of::<F>() + mem::size_of::<ErasedInvoker>() <= INVOCATION_SIZE,
                "a thread's callable and captures must fit in the inline invocation buffer"
            );
            assert!(mem::align_of::<F>() <= mem::align_of::<ErasedInvoker>());
        }
        // SAFETY: The buffer is 64-byte aligned and exclusively ours per the
        // caller's reservation; the size and alignment of F are checked above.
        unsafe {
            let base = self.data.get().cast::<u8>();
            base.cast::<ErasedInvoker>().write(invoke_erased::<F>);
            base.add(mem::size_of::<ErasedInvoker>()).cast::<F>().write(f);
        }
    }

    /// Runs the stored callable, consuming it.
    ///
    /// # Safety
    ///
    /// A callable must have been stored since the slot was last reserved, and
    /// this must be called exactly once per store.
    pub unsafe fn run(&self) {
        // SAFETY: `store` wrote the invoker and payload at these offsets.
        unsafe {
            let base = self.data.get().cast::<u8>();
            let invoker = base.cast::<ErasedInvoker>().read();
            invoker(base.add(mem::size_of::<ErasedInvoker>()));
        }
    }
}

/// All the state for one thread slot. Slots are allocated at initialization,
/// live for the life of the runtime, and host many threads in sequence,
/// distinguished by `generation`.
#[repr(C)]
pub struct ThreadContext {
    /// Invocation buffer and wakeup deadline; first so the hot cache line
    /// sits at offset zero.
    pub(crate) invocation: InvocationSlot,

    /// The stack pointer to resume at, valid only between a swap-out and the
    /// matching swap-in. Touched only by the owning core's dispatcher.
    sp: Cell<*mut u8>,

    /// Lowest address of the owned stack allocation; a canary word lives
    /// here to detect overflow.
    stack_bottom: *mut u8,
    stack_size: usize,

    /// Incremented each time a thread finishes in this slot; paired with the
    /// context pointer to form a `ThreadId` that detects slot reuse.
    pub(crate) generation: AtomicU32,

    /// Bit index in the owning core's occupancy mask. Changes only while the
    /// slot is unoccupied, during drain migration.
    pub(crate) id_in_core: AtomicU8,

    /// The core this slot currently lives on.
    pub(crate) core_id: AtomicU8,

    /// Scheduling class recorded at creation for the core policy's benefit.
    pub(crate) thread_class: AtomicU32,

    /// True from the moment the trampoline begins the invocation until the
    /// thread finishes; a reserved slot with this clear is migratable.
    pub(crate) started: AtomicBool,

    /// Serializes joiners against this slot's exit path.
    pub(crate) join_lock: SpinLock<()>,

    /// Joiners of the currently hosted thread park here.
    pub(crate) join_cv: ConditionVariable,
}

// SAFETY: Shared fields are atomics; `sp` and the invocation buffer are
// guarded by the scheduling protocol (only the owning core's dispatcher uses
// `sp`; the invocation buffer belongs to the reserving creator until the
// release-store of the wakeup deadline hands it to the owning core).
unsafe impl Sync for ThreadContext {}
// SAFETY: As above; the raw stack pointer is owned by the slot for the life
// of the runtime.
unsafe impl Send for ThreadContext {}

impl ThreadContext {
    /// Allocates a context and its stack. Slots are never freed; the runtime
    /// owns them until process exit.
    pub(crate) fn new(core_id: u8, id_in_core: u8, stack_size: usize) -> Self {
        let layout = Layout::from_size_align(stack_size, 16).expect("bad stack size");
        // SAFETY: `layout` has non-zero size (enforced by configuration).
        let stack_bottom = unsafe { alloc::alloc(layout) };
        if stack_bottom.is_null() {
            alloc::handle_alloc_error(layout);
        }
        let context = Self {
            invocation: InvocationSlot::new(),
            sp: Cell::new(core::ptr::null_mut()),
            stack_bottom,
            stack_size,
            generation: AtomicU32::new(0),
            id_in_core: AtomicU8::new(id_in_core),
            core_id: AtomicU8::new(core_id),
            thread_class: AtomicU32::new(0),
            started: AtomicBool::new(false),
            join_lock: SpinLock::named("join", ()),
            join_cv: ConditionVariable::new(),
        };
        context.initialize_stack();
        context
    }

    /// Lays the canary and the first-entry frame so the first swap into this
    /// slot enters the trampoline. Only valid while the slot is unoccupied.
    pub(crate) fn initialize_stack(&self) {
        // SAFETY: The slot is unoccupied, so nothing executes on this stack;
        // the allocation is `stack_size` bytes from `stack_bottom`.
        unsafe {
            self.stack_bottom.cast::<u64>().write(STACK_CANARY);
            let top = self.stack_bottom.add(self.stack_size);
            self.sp
                .set(context::lay_trampoline(top, dispatcher::scheduler_main_loop));
        }
    }

    pub(crate) fn sp(&self) -> &Cell<*mut u8> {
        &self.sp
    }

    pub(crate) fn wakeup(&self) -> &AtomicU64 {
        &self.invocation.wakeup_time_in_cycles
    }

    /// Whether the overflow canary at the low end of the stack is intact.
    pub(crate) fn stack_canary_intact(&self) -> bool {
        // SAFETY: `stack_bottom` points at our live allocation.
        unsafe { self.stack_bottom.cast::<u64>().read() == STACK_CANARY }
    }

    /// The id of the thread currently (or most recently) hosted here.
    pub(crate) fn current_id(&'static self) -> ThreadId {
        ThreadId {
            context: self,
            generation: self.generation.load(Ordering::Acquire),
        }
    }
}

/// Identifies one thread for the lifetime of the runtime. Refers to a slot
/// plus the generation observed at creation, so ids referring to finished
/// threads are always detectable.
#[derive(Clone, Copy)]
pub struct ThreadId {
    pub(crate) context: &'static ThreadContext,
    pub(crate) generation: u32,
}

impl ThreadId {
    pub(crate) fn new(context: &'static ThreadContext, generation: u32) -> Self {
        Self {
            context,
            generation,
        }
    }
}

impl PartialEq for ThreadId {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.context, other.context) && self.generation == other.generation
    }
}

impl Eq for ThreadId {}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadId")
            .field("core", &self.context.core_id.load(Ordering::Relaxed))
            .field("slot", &self.context.id_in_core.load(Ordering::Relaxed))
            .field("generation", &self.generation)
            .finish()
    }
}
