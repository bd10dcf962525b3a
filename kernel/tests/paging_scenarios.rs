use kidneyos_shared::mem::{PAGE_FRAME_SIZE, PHYS_BASE, SECTORS_PER_PAGE};
use kidneyos_vm::block::{Block, BlockError, BlockManager, BlockOp, BlockSector, BlockType};
use kidneyos_vm::drivers::RamDisk;
use kidneyos_vm::interrupts::page_fault::{
    handle_page_fault, FaultResolution, PageFault, EXIT_FATAL_ACCESS,
};
use kidneyos_vm::mem::user::{copy_from_user, copy_to_user};
use kidneyos_vm::mem::{AddressSpace, Backing, Residency, VirtualMemory, VmConfig};
use kidneyos_vm::paging::VirtPage;
use kidneyos_vm::system::{init_system, try_system, virtual_memory, SystemState};
use kidneyos_vm::user_program::{load_image, setup_stack, Executable, MemoryFile, Segment};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serial_test::serial;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const BASE: usize = 0x0804_8000;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn swap_device(slots: usize) -> Arc<Block> {
    let sectors = slots * SECTORS_PER_PAGE;
    Arc::new(Block::new(
        "swap",
        BlockType::Swap,
        sectors as BlockSector,
        Box::new(RamDisk::new(sectors)),
    ))
}

fn vm(frames: usize, swap_slots: usize) -> Arc<VirtualMemory> {
    init_logging();
    VirtualMemory::new(
        VmConfig::default().with_user_frames(frames),
        swap_device(swap_slots),
    )
}

fn page(n: usize) -> VirtPage {
    VirtPage::containing(BASE + n * PAGE_FRAME_SIZE)
}

fn random_page(rng: &mut StdRng) -> Vec<u8> {
    (0..PAGE_FRAME_SIZE).map(|_| rng.gen()).collect()
}

fn zero_pages(space: &AddressSpace, count: usize) {
    for n in 0..count {
        space.insert(page(n), Backing::ZeroFill, true).unwrap();
    }
}

fn residency(space: &AddressSpace, n: usize) -> Residency {
    space.find(page(n)).unwrap().residency()
}

#[test]
fn fifth_page_evicts_a_clean_page() {
    let vm = vm(4, 4);
    let space = vm.page_table_create();
    zero_pages(&space, 5);

    for n in 0..5 {
        let fault = PageFault::read(page(n).addr(), PHYS_BASE);
        assert_eq!(handle_page_fault(&space, &fault), FaultResolution::Resolved);
    }

    let stats = vm.stats();
    assert_eq!(stats.faults, 5);
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.discards, 1);
    assert_eq!(stats.swap_outs, 0);
    assert_eq!(vm.frames().frames_in_use(), 4);
    assert_eq!(vm.swap().slots_in_use(), 0);

    let resident = (0..5)
        .filter(|n| residency(&space, *n) == Residency::Resident)
        .count();
    assert_eq!(resident, 4);
    assert_eq!(residency(&space, 4), Residency::Resident);
    vm.page_table_destroy(&space);
}

#[test]
fn dirty_page_survives_swap() {
    let vm = vm(1, 4);
    let space = vm.page_table_create();
    zero_pages(&space, 2);
    let mut rng = StdRng::seed_from_u64(7);
    let first = random_page(&mut rng);
    let second = random_page(&mut rng);

    assert!(copy_to_user(&space, page(0).addr(), &first));
    assert!(copy_to_user(&space, page(1).addr(), &second));
    assert_eq!(residency(&space, 0), Residency::InSwap);
    assert_eq!(vm.swap().slots_in_use(), 1);

    assert_eq!(copy_from_user(&space, page(0).addr(), PAGE_FRAME_SIZE), Some(first));
    let desc = space.find(page(0)).unwrap();
    assert_eq!(desc.residency(), Residency::Resident);
    assert_eq!(desc.swap_slot(), None);
    assert!(desc.is_diverged());

    assert_eq!(residency(&space, 1), Residency::InSwap);
    assert_eq!(copy_from_user(&space, page(1).addr(), PAGE_FRAME_SIZE), Some(second));

    let stats = vm.stats();
    assert_eq!(stats.swap_ins, 2);
    assert_eq!(stats.swap_outs, 3);
    assert_eq!(vm.swap().slots_in_use(), 1);
    vm.page_table_destroy(&space);
    assert_eq!(vm.swap().slots_in_use(), 0);
}

#[test]
fn short_executable_kills_without_leaking() {
    let vm = vm(2, 2);
    let space = vm.page_table_create();
    let file: Arc<dyn Executable> = Arc::new(MemoryFile::new(vec![0x90; 100]));
    let backing = Backing::Executable {
        file,
        offset: 0,
        read_bytes: PAGE_FRAME_SIZE,
    };
    space.insert(page(0), backing, false).unwrap();

    let fault = PageFault::read(page(0).addr(), PHYS_BASE);
    assert_eq!(
        handle_page_fault(&space, &fault),
        FaultResolution::Kill {
            status: EXIT_FATAL_ACCESS
        }
    );
    assert_eq!(residency(&space, 0), Residency::NotLoaded);
    assert_eq!(vm.frames().frames_in_use(), 0);
    assert!(space.directory().translate(page(0)).is_none());
}

#[test]
fn loaded_image_runs_from_its_file() {
    let vm = vm(4, 4);
    let space = vm.page_table_create();
    let mut rng = StdRng::seed_from_u64(11);
    let text = random_page(&mut rng);
    let file: Arc<dyn Executable> = Arc::new(MemoryFile::new(text.clone()));
    let segments = [
        Segment {
            file_offset: 0,
            vaddr: BASE,
            file_size: PAGE_FRAME_SIZE,
            mem_size: PAGE_FRAME_SIZE,
            writable: false,
        },
        Segment {
            file_offset: 0,
            vaddr: BASE + PAGE_FRAME_SIZE,
            file_size: 0,
            mem_size: 2 * PAGE_FRAME_SIZE,
            writable: true,
        },
    ];

    let esp = load_image(&space, file, &segments).unwrap();
    assert_eq!(esp, PHYS_BASE);
    assert_eq!(space.page_count(), 4);
    assert_eq!(vm.frames().frames_in_use(), 1);

    assert_eq!(copy_from_user(&space, BASE, PAGE_FRAME_SIZE), Some(text));
    assert!(!copy_to_user(&space, BASE, &[0]));
    assert!(copy_to_user(&space, BASE + PAGE_FRAME_SIZE, &[1, 2, 3]));
    assert_eq!(
        copy_from_user(&space, BASE + PAGE_FRAME_SIZE, 4),
        Some(vec![1, 2, 3, 0])
    );
    vm.page_table_destroy(&space);
}

#[test]
fn stack_page_is_resident_on_insert() {
    let vm = vm(2, 2);
    let space = vm.page_table_create();
    let esp = setup_stack(&space).unwrap();
    let top = VirtPage::containing(esp - 1);

    assert_eq!(space.find(top).unwrap().residency(), Residency::Resident);
    assert_eq!(vm.frames().frames_in_use(), 1);
    assert!(space.directory().translate(top).is_some());
    assert_eq!(vm.stats().faults, 0);
}

#[test]
fn repeated_faults_are_idempotent() {
    let vm = vm(2, 2);
    let space = vm.page_table_create();
    zero_pages(&space, 1);
    let fault = PageFault::write(page(0).addr(), PHYS_BASE);

    assert_eq!(handle_page_fault(&space, &fault), FaultResolution::Resolved);
    let frame = space.find(page(0)).unwrap().frame();
    assert_eq!(handle_page_fault(&space, &fault), FaultResolution::Resolved);

    assert_eq!(space.find(page(0)).unwrap().frame(), frame);
    assert_eq!(vm.frames().frames_in_use(), 1);
    assert_eq!(vm.stats().evictions, 0);
}

#[test]
fn swap_slots_are_never_shared() {
    let vm = vm(2, 16);
    let space = vm.page_table_create();
    zero_pages(&space, 10);
    let mut rng = StdRng::seed_from_u64(3);
    let contents: Vec<Vec<u8>> = (0..10).map(|_| random_page(&mut rng)).collect();

    for (n, bytes) in contents.iter().enumerate() {
        assert!(copy_to_user(&space, page(n).addr(), bytes));
    }

    let slots: Vec<usize> = (0..10)
        .filter_map(|n| space.find(page(n)).unwrap().swap_slot())
        .map(|slot| slot.index())
        .collect();
    let unique: BTreeSet<usize> = slots.iter().copied().collect();
    assert_eq!(slots.len(), 8);
    assert_eq!(unique.len(), slots.len());
    assert_eq!(vm.swap().slots_in_use(), slots.len());
    assert_eq!(space.swap_slots_held(), slots.len());

    for (n, bytes) in contents.iter().enumerate() {
        assert_eq!(
            copy_from_user(&space, page(n).addr(), PAGE_FRAME_SIZE).as_ref(),
            Some(bytes)
        );
    }
    vm.page_table_destroy(&space);
}

#[test]
fn teardown_releases_everything() {
    let vm = vm(2, 8);
    let space = vm.page_table_create();
    zero_pages(&space, 5);
    for n in 0..5 {
        assert!(copy_to_user(&space, page(n).addr(), &[n as u8 + 1]));
    }
    setup_stack(&space).unwrap();
    assert!(vm.swap().slots_in_use() > 0);

    vm.page_table_destroy(&space);
    assert_eq!(vm.frames().frames_in_use(), 0);
    assert_eq!(vm.swap().slots_in_use(), 0);
    assert_eq!(vm.live_spaces(), 0);
    assert_eq!(space.page_count(), 0);
    assert!(space.directory().translate(page(0)).is_none());

    let fault = PageFault::read(page(0).addr(), PHYS_BASE);
    assert!(matches!(
        handle_page_fault(&space, &fault),
        FaultResolution::Kill { .. }
    ));

    vm.page_table_destroy(&space);
    assert_eq!(vm.live_spaces(), 0);
}

#[test]
fn stack_grows_under_the_stack_pointer() {
    let vm = vm(4, 4);
    let space = vm.page_table_create();
    let mut esp = setup_stack(&space).unwrap();

    // A push just below the current page.
    esp -= PAGE_FRAME_SIZE + 4;
    let push = PageFault::write(esp, esp + 4);
    assert_eq!(handle_page_fault(&space, &push), FaultResolution::Resolved);
    let grown = space.find(VirtPage::containing(esp)).unwrap();
    assert!(grown.origin().is_stack());
    assert_eq!(grown.residency(), Residency::Resident);

    // Far below the stack pointer is a bad access, not growth.
    let wild = PageFault::write(esp - 4 * PAGE_FRAME_SIZE, esp);
    assert_eq!(
        handle_page_fault(&space, &wild),
        FaultResolution::Kill {
            status: EXIT_FATAL_ACCESS
        }
    );
    assert_eq!(space.page_count(), 2);
}

/// Swap partition whose writes fail once `broken` is set.
struct FailingDisk {
    disk: RamDisk,
    broken: Arc<AtomicBool>,
}

impl BlockOp for FailingDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.disk.read(sector, buf)
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(BlockError::WriteError);
        }
        self.disk.write(sector, buf)
    }
}

#[test]
fn failed_swap_out_keeps_the_victim() {
    init_logging();
    let broken = Arc::new(AtomicBool::new(false));
    let sectors = 4 * SECTORS_PER_PAGE;
    let device = Arc::new(Block::new(
        "bad-swap",
        BlockType::Swap,
        sectors as BlockSector,
        Box::new(FailingDisk {
            disk: RamDisk::new(sectors),
            broken: broken.clone(),
        }),
    ));
    let vm = VirtualMemory::new(VmConfig::default().with_user_frames(1), device);
    let space = vm.page_table_create();
    zero_pages(&space, 2);

    let data = [0x5A; 64];
    assert!(copy_to_user(&space, page(0).addr(), &data));
    broken.store(true, Ordering::SeqCst);

    let fault = PageFault::read(page(1).addr(), PHYS_BASE);
    assert_eq!(
        handle_page_fault(&space, &fault),
        FaultResolution::Kill {
            status: EXIT_FATAL_ACCESS
        }
    );
    assert_eq!(residency(&space, 0), Residency::Resident);
    assert_eq!(residency(&space, 1), Residency::NotLoaded);
    assert!(space.find(page(0)).unwrap().is_diverged());
    assert_eq!(vm.swap().slots_in_use(), 0);
    assert_eq!(copy_from_user(&space, page(0).addr(), 64), Some(data.to_vec()));

    broken.store(false, Ordering::SeqCst);
    assert_eq!(handle_page_fault(&space, &fault), FaultResolution::Resolved);
    assert_eq!(residency(&space, 0), Residency::InSwap);
}

#[test]
#[should_panic(expected = "Out of swap space")]
fn running_out_of_swap_panics() {
    let vm = vm(1, 1);
    let space = vm.page_table_create();
    zero_pages(&space, 3);
    for n in 0..3 {
        copy_to_user(&space, page(n).addr(), &[1]);
    }
}

#[test]
fn processes_share_frames_concurrently() {
    const WORKERS: usize = 4;
    let vm = vm(6, 64);
    let barrier = Arc::new(Barrier::new(WORKERS));
    let workers: Vec<_> = (0..WORKERS as u64)
        .map(|seed| {
            let vm = vm.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let space = vm.page_table_create();
                zero_pages(&space, 6);
                let mut rng = StdRng::seed_from_u64(seed);
                let contents: Vec<Vec<u8>> = (0..6).map(|_| random_page(&mut rng)).collect();

                // Every address space is live before anyone touches memory.
                barrier.wait();
                for _ in 0..10 {
                    for (n, bytes) in contents.iter().enumerate() {
                        assert!(copy_to_user(&space, page(n).addr(), bytes));
                    }
                    for (n, bytes) in contents.iter().enumerate() {
                        let read = copy_from_user(&space, page(n).addr(), PAGE_FRAME_SIZE);
                        assert_eq!(read.as_ref(), Some(bytes));
                    }
                }
                barrier.wait();
                vm.page_table_destroy(&space);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(vm.frames().frames_in_use(), 0);
    assert_eq!(vm.swap().slots_in_use(), 0);
    assert_eq!(vm.live_spaces(), 0);
    assert!(vm.stats().swap_outs > 0);
}

fn block_manager() -> BlockManager {
    let mut block_manager = BlockManager::new();
    block_manager.register_block(BlockType::Raw, "hda", 8, Box::new(RamDisk::new(8)));
    let sectors = 32 * SECTORS_PER_PAGE;
    block_manager.register_block(
        BlockType::Swap,
        "hdb",
        sectors as BlockSector,
        Box::new(RamDisk::new(sectors)),
    );
    block_manager
}

fn system() -> &'static SystemState {
    if let Some(system) = try_system() {
        return system;
    }
    init_logging();
    init_system(block_manager(), VmConfig::default().with_user_frames(8))
}

#[test]
#[serial]
fn global_virtual_memory() {
    let system = system();
    assert_eq!(system.virtual_memory.swap().device().get_name(), "hdb");
    assert_eq!(system.virtual_memory.frames().capacity(), 8);

    let space = virtual_memory().page_table_create();
    zero_pages(&space, 1);
    assert!(copy_to_user(&space, BASE, b"hello"));
    assert_eq!(copy_from_user(&space, BASE, 5), Some(b"hello".to_vec()));
    virtual_memory().page_table_destroy(&space);
}

#[test]
#[serial]
#[should_panic(expected = "System already initialized.")]
fn system_initializes_once() {
    system();
    init_system(block_manager(), VmConfig::default());
}
