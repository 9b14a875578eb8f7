use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use comet_stw::{initialize, Config, StackRange, ThreadRecord, ThreadTable};
use parking_lot::Mutex;

const WORKERS: usize = 4;
const CYCLES: usize = 10;

/// Scans `range` word by word for values in `roots`, the way a conservative
/// marker would.
unsafe fn scan(range: StackRange, roots: &HashSet<usize>) -> usize {
    let align = std::mem::align_of::<usize>();
    let (low, high) = range.words();
    let mut cursor = ((low as usize + align - 1) & !(align - 1)) as *const usize;
    let end = high as *const usize;
    let mut found = 0;
    while cursor < end {
        if roots.contains(&cursor.read_volatile()) {
            found += 1;
        }
        cursor = cursor.add(1);
    }
    found
}

fn main() {
    let world = initialize(Config {
        verbose: true,
        ..Default::default()
    });
    let table = Arc::new(Mutex::new(ThreadTable::new()));
    table.lock().register_main();

    let done = Arc::new(AtomicBool::new(false));
    let ready = Arc::new(AtomicUsize::new(0));
    let roots = Arc::new(Mutex::new(HashSet::new()));
    let mut handles = vec![];
    for i in 0..WORKERS {
        let table = table.clone();
        let done = done.clone();
        let ready = ready.clone();
        let roots = roots.clone();
        handles.push(std::thread::spawn(move || {
            table.lock().register_current();
            let object = Box::new(i as u64);
            roots.lock().insert(&*object as *const u64 as usize);
            ready.fetch_add(1, Ordering::AcqRel);
            let mut work = 0u64;
            while !done.load(Ordering::Relaxed) {
                work = work.wrapping_add(**std::hint::black_box(&object));
            }
            table.lock().unregister_current();
            work
        }));
    }
    while ready.load(Ordering::Acquire) != WORKERS {
        std::thread::yield_now();
    }

    let roots = roots.lock().clone();
    for cycle in 0..CYCLES {
        let threads = table.lock();
        let mut found = 0;
        let visited = unsafe {
            world.stop_world(&*threads);
            let visited = world.collect_roots(&*threads, &mut |_: &ThreadRecord, range: StackRange| {
                found += scan(range, &roots);
            });
            world.start_world(&*threads);
            visited
        };
        drop(threads);
        println!(
            "cycle {}: {} stacks, {} of {} objects referenced",
            cycle,
            visited,
            found,
            roots.len()
        );
        std::thread::sleep(Duration::from_millis(5));
    }

    done.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }
    table.lock().unregister_current();
    println!("{}", world.statistics().snapshot());
}
