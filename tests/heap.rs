//! Drives a heap through a long allocate/reallocate/deallocate workload using
//! only the public API, checking the directory after every step.
use gfheap::{Heap, HeapStats};
use std::{mem::MaybeUninit, ptr::NonNull, slice};

#[repr(align(64))]
struct Arena<const LEN: usize>([MaybeUninit<u8>; LEN]);

impl<const LEN: usize> Arena<LEN> {
    fn new() -> Self {
        Self([MaybeUninit::uninit(); LEN])
    }
}

/// An allocation and the byte it's filled with.
#[derive(Debug)]
struct Tracked {
    ptr: Option<NonNull<u8>>,
    len: usize,
    tag: u8,
}

impl Tracked {
    const NULL: Self = Self {
        ptr: None,
        len: 0,
        tag: 0,
    };
}

fn check<const ALIGN: usize>(t: &Tracked) {
    let Some(ptr) = t.ptr else { return };
    assert_eq!(ptr.as_ptr() as usize % ALIGN, 0, "{:?} is misaligned", t);
    let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr(), t.len) };
    assert!(bytes.iter().all(|&b| b == t.tag), "{:?} was overwritten", t);
}

fn allocate<const ALIGN: usize>(heap: &mut Heap<'_, ALIGN>, len: usize, tag: u8) -> Tracked {
    let ptr = heap.allocate(len).expect("out of memory");
    heap.verify().unwrap();
    unsafe { ptr.as_ptr().write_bytes(tag, len) };
    let t = Tracked {
        ptr: Some(ptr),
        len,
        tag,
    };
    check::<ALIGN>(&t);
    t
}

fn deallocate<const ALIGN: usize>(heap: &mut Heap<'_, ALIGN>, t: &mut Tracked) {
    check::<ALIGN>(t);
    unsafe { heap.deallocate(t.ptr) };
    heap.verify().unwrap();
    *t = Tracked::NULL;
}

fn resize<const ALIGN: usize>(heap: &mut Heap<'_, ALIGN>, t: &mut Tracked, len: usize, tag: u8) {
    check::<ALIGN>(t);
    let was_allocated = t.ptr.is_some();

    let ptr = unsafe { heap.reallocate(t.ptr, len) };
    heap.verify().unwrap();

    if len == 0 && was_allocated {
        assert_eq!(ptr, None);
        *t = Tracked::NULL;
        return;
    }

    let ptr = ptr.expect("out of memory");
    let kept = Tracked {
        ptr: Some(ptr),
        len: t.len.min(len),
        tag: t.tag,
    };
    check::<ALIGN>(&kept);

    unsafe { ptr.as_ptr().write_bytes(tag, len) };
    *t = Tracked {
        ptr: Some(ptr),
        len,
        tag,
    };
}

fn workload<const ALIGN: usize>() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut memory = Arena::<1024>::new();
    let mut extra = Arena::<2048>::new();
    let mut heap: Heap<'_, ALIGN> = Heap::new();
    heap.expand(&mut memory.0);
    heap.verify().unwrap();

    let g = Heap::<'static, ALIGN>::GRANULARITY;
    let whole = HeapStats {
        free_blocks: 1,
        free_bytes: 1024 - g,
        largest_free_block: 1024 - g,
    };

    // Reuse a block freed between two others
    let mut a = allocate(&mut heap, 256, 1);
    let mut b = allocate(&mut heap, 256, 2);
    check::<ALIGN>(&a);
    deallocate(&mut heap, &mut a);
    let mut c = allocate(&mut heap, 256, 3);
    deallocate(&mut heap, &mut c);
    check::<ALIGN>(&b);
    deallocate(&mut heap, &mut b);
    assert_eq!(heap.stats(), whole);

    // Small allocations, some of which move around
    let mut small: Vec<Tracked> = [0, 1, 2, 3, 4, 5, 23]
        .iter()
        .enumerate()
        .map(|(i, &len)| allocate(&mut heap, len, 4 + i as u8))
        .collect();
    resize(&mut heap, &mut small[5], 100, 11);
    resize(&mut heap, &mut small[0], 256, 12);
    resize(&mut heap, &mut small[5], 5, 13);
    small.iter().for_each(check::<ALIGN>);
    for t in small.iter_mut().rev() {
        deallocate(&mut heap, t);
    }
    assert_eq!(heap.stats(), whole);

    let mut x = Tracked::NULL;
    let mut y = Tracked::NULL;

    // One up
    for size in 0..500 {
        resize(&mut heap, &mut x, size, size as u8);
    }
    resize(&mut heap, &mut x, 0, 0);
    assert_eq!(heap.stats(), whole);

    // One down
    for size in 0..500 {
        resize(&mut heap, &mut x, 500 - size, size as u8);
    }
    resize(&mut heap, &mut x, 0, 0);
    assert_eq!(heap.stats(), whole);

    heap.expand(&mut extra.0);
    heap.verify().unwrap();
    assert_eq!(heap.stats().free_blocks, 2);

    // Both up
    for size in 0..500 {
        resize(&mut heap, &mut x, size, size as u8);
        resize(&mut heap, &mut y, size, !(size as u8));
    }
    resize(&mut heap, &mut x, 0, 0);
    resize(&mut heap, &mut y, 0, 0);

    // Both down
    for size in 0..500 {
        resize(&mut heap, &mut x, 500 - size, size as u8);
        resize(&mut heap, &mut y, 500 - size, !(size as u8));
    }
    resize(&mut heap, &mut x, 0, 0);
    resize(&mut heap, &mut y, 0, 0);

    // Up and down
    for size in 0..500 {
        resize(&mut heap, &mut x, size, size as u8);
        resize(&mut heap, &mut y, 500 - size, !(size as u8));
    }
    resize(&mut heap, &mut x, 0, 0);
    resize(&mut heap, &mut y, 0, 0);

    // Everything coalesced back, one block per arena
    assert_eq!(
        heap.stats(),
        HeapStats {
            free_blocks: 2,
            free_bytes: 1024 - g + 2048 - g,
            largest_free_block: 2048 - g,
        }
    );
}

#[test]
fn workload_align4() {
    workload::<4>();
}

#[test]
fn workload_align8() {
    workload::<8>();
}

#[test]
fn workload_align16() {
    workload::<16>();
}

#[test]
fn null_is_a_no_op() {
    let mut memory = Arena::<256>::new();
    let mut heap: Heap = Heap::default();
    heap.expand(&mut memory.0);

    let before = heap.stats();
    unsafe { heap.deallocate(None) };
    assert_eq!(heap.stats(), before);
    heap.verify().unwrap();
}
