//! Host stand-ins for hardware and the rest of the kernel, used by unit tests.

use std::boxed::Box;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::string::{String, ToString};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::vec::Vec;

use core::ptr::NonNull;

use spin::Mutex;

use crate::arch::{CpuId, Processor};
use crate::fault::{Signal, ThreadContext};
use crate::mm::address::{PhysAddr, VirtAddr, PAGE_SIZE, PHYS_MEM_BASE};
use crate::mm::address_space::AddressSpace;
use crate::mm::config::MemoryConfig;
use crate::mm::inode::{Inode, InodeError, InodeId};
use crate::mm::manager::MemoryManager;
use crate::mm::physical::PhysicalMemory;

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE]);

/// Page-aligned host buffer posing as RAM at `PHYS_MEM_BASE`.
///
/// The buffer is leaked so that frames stay valid for as long as any
/// allocator or page handle built on top of it.
pub struct HostRam {
    memory: Arc<PhysicalMemory>,
}

impl HostRam {
    pub fn new(pages: usize) -> Self {
        let frames: Vec<Frame> = (0..pages).map(|_| Frame([0; PAGE_SIZE])).collect();
        let frames: &'static mut [Frame] = frames.leak();
        let window = NonNull::new(frames.as_mut_ptr().cast::<u8>()).unwrap();
        // SAFETY: The leaked buffer is valid, aligned and unaliased forever.
        let memory =
            unsafe { PhysicalMemory::new(PhysAddr::new(PHYS_MEM_BASE), window, pages * PAGE_SIZE) };
        Self {
            memory: Arc::new(memory),
        }
    }

    pub fn base(&self) -> PhysAddr {
        self.memory.base()
    }

    pub fn memory(&self) -> Arc<PhysicalMemory> {
        self.memory.clone()
    }
}

thread_local! {
    static CURRENT_CPU: Cell<CpuId> = const { Cell::new(0) };
    static IRQ_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// A processor whose CPU id and IRQ state are per test thread.
pub struct SimulatedProcessor {
    cpus: usize,
    pub local_flushes: AtomicUsize,
    pub shootdowns: AtomicUsize,
    pub full_flushes: AtomicUsize,
}

impl SimulatedProcessor {
    pub fn new(cpus: usize) -> Self {
        Self {
            cpus,
            local_flushes: AtomicUsize::new(0),
            shootdowns: AtomicUsize::new(0),
            full_flushes: AtomicUsize::new(0),
        }
    }

    pub fn set_current_cpu(cpu: CpuId) {
        CURRENT_CPU.with(|c| c.set(cpu));
    }

    pub fn enter_irq() {
        IRQ_DEPTH.with(|d| d.set(d.get() + 1));
    }

    pub fn leave_irq() {
        IRQ_DEPTH.with(|d| d.set(d.get() - 1));
    }
}

impl Processor for SimulatedProcessor {
    fn current_cpu(&self) -> CpuId {
        CURRENT_CPU.with(Cell::get)
    }

    fn cpu_count(&self) -> usize {
        self.cpus
    }

    fn in_irq(&self) -> bool {
        IRQ_DEPTH.with(Cell::get) > 0
    }

    fn flush_tlb_local(&self, _vaddr: VirtAddr, _page_count: usize) {
        self.local_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_tlb_others(&self, _vaddr: VirtAddr, _page_count: usize) {
        self.shootdowns.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_tlb_all(&self) {
        self.full_flushes.fetch_add(1, Ordering::Relaxed);
    }
}

/// Runs once, inside the next `read_page`, after the data was copied.
pub type ReadHook = Box<dyn FnOnce() + Send>;

/// A file held in memory, with switchable read failures.
pub struct MemoryInode {
    id: InodeId,
    data: Mutex<Vec<u8>>,
    pub reads: AtomicUsize,
    pub fail_reads: AtomicBool,
    pub written_back: Mutex<Vec<usize>>,
    pub on_read: Mutex<Option<ReadHook>>,
}

impl MemoryInode {
    pub fn new(id: u64, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            id: InodeId(id),
            data: Mutex::new(data),
            reads: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            written_back: Mutex::new(Vec::new()),
            on_read: Mutex::new(None),
        })
    }

    /// `pages` pages, page `i` filled with byte `i + 1`.
    pub fn patterned(id: u64, pages: usize) -> Arc<Self> {
        let data = (0..pages * PAGE_SIZE).map(|b| (b / PAGE_SIZE + 1) as u8).collect();
        Self::new(id, data)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    pub fn overwrite(&self, offset: usize, bytes: &[u8]) {
        self.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl Inode for MemoryInode {
    fn id(&self) -> InodeId {
        self.id
    }

    fn size(&self) -> usize {
        self.data.lock().len()
    }

    fn read_page(&self, page_index: usize) -> Result<Vec<u8>, InodeError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(InodeError::Io);
        }
        let bytes = {
            let data = self.data.lock();
            let start = page_index * PAGE_SIZE;
            if start >= data.len() {
                return Err(InodeError::BeyondEnd);
            }
            let end = (start + PAGE_SIZE).min(data.len());
            data[start..end].to_vec()
        };
        let hook = self.on_read.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(bytes)
    }

    fn write_back(&self, page_index: usize, bytes: &[u8]) -> Result<(), InodeError> {
        let mut data = self.data.lock();
        let start = page_index * PAGE_SIZE;
        if start >= data.len() {
            return Err(InodeError::BeyondEnd);
        }
        let len = bytes.len().min(data.len() - start);
        data[start..start + len].copy_from_slice(&bytes[..len]);
        self.written_back.lock().push(page_index);
        Ok(())
    }
}

/// The faulting thread as seen by the dispatcher.
pub struct FakeThread {
    pub space: Option<Arc<AddressSpace>>,
    pub handlers: Vec<Signal>,
    pub signals: Mutex<Vec<Signal>>,
    pub coredump: Mutex<BTreeMap<String, String>>,
}

impl FakeThread {
    pub fn new(space: Option<Arc<AddressSpace>>) -> Self {
        Self {
            space,
            handlers: Vec::new(),
            signals: Mutex::new(Vec::new()),
            coredump: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_handler(mut self, signal: Signal) -> Self {
        self.handlers.push(signal);
        self
    }

    pub fn sent(&self) -> Vec<Signal> {
        self.signals.lock().clone()
    }

    pub fn property(&self, key: &str) -> Option<String> {
        self.coredump.lock().get(key).cloned()
    }
}

impl ThreadContext for FakeThread {
    fn address_space(&self) -> Option<Arc<AddressSpace>> {
        self.space.clone()
    }

    fn has_signal_handler(&self, signal: Signal) -> bool {
        self.handlers.contains(&signal)
    }

    fn send_urgent_signal_to_self(&self, signal: Signal) {
        self.signals.lock().push(signal);
    }

    fn set_coredump_property(&self, key: &str, value: &str) {
        self.coredump
            .lock()
            .insert(key.to_string(), value.to_string());
    }
}

/// A booted memory manager on host RAM.
pub struct Machine {
    pub ram: HostRam,
    pub processor: Arc<SimulatedProcessor>,
    pub mm: Arc<MemoryManager>,
}

impl Machine {
    /// Boot with `user_pages` user frames, 64 supervisor frames and `cpus` CPUs.
    pub fn boot(user_pages: usize, cpus: usize) -> Self {
        Self::boot_with(user_pages, 64, cpus)
    }

    pub fn boot_with(user_pages: usize, supervisor_pages: usize, cpus: usize) -> Self {
        let pages = user_pages + supervisor_pages;
        let ram = HostRam::new(pages);
        let config = MemoryConfig::single_range(ram.base(), pages, supervisor_pages);
        let processor = Arc::new(SimulatedProcessor::new(cpus));
        let mm = MemoryManager::new(&config, ram.memory(), processor.clone()).unwrap();
        Self { ram, processor, mm }
    }

    /// Read the bytes of a frame through the physical window.
    pub fn frame_bytes(&self, paddr: PhysAddr) -> Vec<u8> {
        // SAFETY: Tests only inspect frames no other thread is writing.
        unsafe { self.ram.memory().frame_mut(paddr.align_down()) }.to_vec()
    }
}
