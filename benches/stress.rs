use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use gfheap::Heap;
use std::{alloc::Layout, hint::black_box, mem::MaybeUninit, ptr::NonNull};

const ARENA_LEN: usize = 1024 * 50;
const MAX_ALLOCS: usize = 256;

/// The allocators below are compared at this alignment.
const ALIGN: usize = 8;

#[repr(align(64))]
#[derive(Clone, Copy)]
struct Chunk([MaybeUninit<u8>; 64]);

/// A heap-allocated, well-aligned arena.
struct Arena(Vec<Chunk>);

impl Arena {
    fn new() -> Self {
        Self(vec![Chunk([MaybeUninit::uninit(); 64]); ARENA_LEN / 64])
    }

    fn as_ptr(&mut self) -> NonNull<[u8]> {
        let len = self.0.len() * 64;
        let start = self.0.as_mut_ptr() as *mut u8;
        NonNull::new(std::ptr::slice_from_raw_parts_mut(start, len)).unwrap()
    }
}

struct Xorshift32(u32);

impl Xorshift32 {
    fn next(&mut self) -> u32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        self.0
    }
}

const SIZE_RANGES: &[(usize, usize)] = &[
    (1, 7),
    (1, 15),
    (1, 63),
    (1, 255),
    (16, 15),
    (16, 63),
    (16, 127),
    (64, 63),
    (64, 127),
    (128, 127),
];

/// Keep a pool of live allocations and repeatedly replace a random one.
fn bench_one<T>(
    c: &mut Criterion,
    name: &str,
    mut init: impl FnMut(NonNull<[u8]>) -> T,
    mut alloc: impl FnMut(&mut T, usize) -> NonNull<u8>,
    mut dealloc: impl FnMut(&mut T, NonNull<u8>, usize),
) {
    let mut group = c.benchmark_group(name);

    for &(min_size, mask) in SIZE_RANGES {
        let size_range = min_size..min_size + mask + 1;
        let num_allocs = (ARENA_LEN / (size_range.end + 16) / 2).min(MAX_ALLOCS);

        let mut arena = Arena::new();
        let mut state = init(arena.as_ptr());

        let mut rng = Xorshift32(0x12345689);
        let mut next_len = move || (rng.next() as usize & mask) + min_size;

        // Fill `allocs`
        let mut allocs: Vec<(NonNull<u8>, usize)> = (0..num_allocs)
            .map(|_| {
                let len = next_len();
                (alloc(&mut state, len), len)
            })
            .collect();

        group.bench_function(
            BenchmarkId::from_parameter(format_args!("size {:?}", size_range)),
            |b| {
                let mut alloc_i = 0;
                b.iter(|| {
                    let slot = &mut allocs[alloc_i % num_allocs];

                    // deallocate
                    dealloc(&mut state, slot.0, slot.1);

                    // allocate
                    let len = next_len();
                    *slot = (alloc(&mut state, len), len);

                    alloc_i = alloc_i.wrapping_add(1);
                });
            },
        );

        for (p, len) in allocs {
            dealloc(&mut state, p, len);
        }
        drop(state);
        drop(arena);
    }
}

fn bench_reallocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("gfheap_reallocate");

    for &(min_size, mask) in SIZE_RANGES {
        let size_range = min_size..min_size + mask + 1;
        let num_allocs = (ARENA_LEN / (size_range.end + 16) / 2).min(MAX_ALLOCS);

        let mut arena = Arena::new();
        let mut heap: Heap<'static, ALIGN> = Heap::new();
        unsafe { heap.expand_ptr(arena.as_ptr()) };

        let mut rng = Xorshift32(0x12345689);
        let mut next_len = move || (rng.next() as usize & mask) + min_size;

        let mut allocs: Vec<NonNull<u8>> = (0..num_allocs)
            .map(|_| heap.allocate(next_len()).unwrap())
            .collect();

        group.bench_function(
            BenchmarkId::from_parameter(format_args!("size {:?}", size_range)),
            |b| {
                let mut alloc_i = 0;
                b.iter(|| {
                    let slot = &mut allocs[alloc_i % num_allocs];
                    *slot = unsafe { heap.reallocate(Some(*slot), next_len()) }.unwrap();
                    alloc_i = alloc_i.wrapping_add(1);
                });
            },
        );

        drop(heap);
        drop(arena);
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("noop", |b| b.iter(|| black_box(())));

    bench_one(
        c,
        "gfheap",
        |arena| {
            let mut heap: Heap<'static, ALIGN> = Heap::new();
            unsafe { heap.expand_ptr(arena) };
            heap
        },
        |heap, len| heap.allocate(len).unwrap(),
        |heap, p, _| unsafe { heap.deallocate(Some(p)) },
    );

    bench_one(
        c,
        "linked_list_allocator",
        |arena| {
            let mut heap = linked_list_allocator::Heap::empty();
            unsafe { heap.init(arena.as_ptr() as *mut u8 as usize, arena.len()) };
            heap
        },
        |heap, len| {
            let layout = Layout::from_size_align(len, ALIGN).unwrap();
            heap.allocate_first_fit(layout).unwrap()
        },
        |heap, p, len| unsafe {
            let layout = Layout::from_size_align(len, ALIGN).unwrap();
            heap.deallocate(p, layout)
        },
    );

    bench_reallocate(c);
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
