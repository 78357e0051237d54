//! # Kernel Memory Management
//!
//! Physical frame allocation, per-address-space region bookkeeping, the
//! dynamic kernel mapping window and the kernel heap.
//!
//! ```text
//! ┌────────────────────┐   ┌────────────────────┐
//! │ Heap               │──▶│ DynamicMapper      │  kernel virtual ranges
//! └────────────────────┘   └─────────┬──────────┘
//!                                    ▼
//!                          ┌────────────────────┐
//!                          │ Vmm                │  regions + page tables
//!                          └─────────┬──────────┘
//!                                    ▼
//!                          ┌────────────────────┐
//!                          │ PhysicalMemory-    │  buddy allocator over
//!                          │ Allocator          │  the PFN database
//!                          └────────────────────┘
//! ```
//!
//! Nothing here allocates from a heap. Every index is an [`avl::AvlTree`]
//! over a slot slice the caller provides; the kernel carves those slices out
//! of direct-mapped frames at boot, tests use `Vec`s.
//!
//! | Module | Content |
//! |--------|---------|
//! | [`pma`] | Buddy allocator for 4 KiB frames (orders 0..=10). |
//! | [`avl`] | Fixed-capacity AVL map with neighbour queries. |
//! | [`free_list`] | Coalescing free range index with best-fit carving. |
//! | [`vmm`] | Region-tracked mapping on top of `kernel_vmem::AddressSpace`. |
//! | [`dynmap`] | Best-fit allocator of the dynamic kernel window. |
//! | [`heap`] | Byte-granular kernel heap with on-demand growth. |
//! | [`slab`] | Fixed-size object caches carved from heap slabs. |
//! | [`phys_mapper`] | `PhysMapper` over the kernel's direct map. |

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod avl;
pub mod dynmap;
pub mod free_list;
pub mod heap;
pub mod phys_mapper;
pub mod pma;
pub mod slab;
pub mod vmm;
