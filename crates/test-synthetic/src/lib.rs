//! Fake HotSpot class metadata living in this process's own memory.
//!
//! Objects follow the `hotspot-jdk8` layout: `Klass::_name` at +16 and `Symbol::_body` at
//! +8, so a [`FakeClass`] handle resolves through [`tlabscope::ProcessMemory`] exactly like
//! a real class handle would.

use tlabscope::{RegisterContext, TYPE_NAME_LEN};

#[repr(C)]
struct FakeSymbol {
    _length_and_refcount: u64,
    body: [u8; TYPE_NAME_LEN],
}

#[repr(C)]
struct FakeKlass {
    _layout_helper: u64,
    _super_check_offset: u64,
    name: *const FakeSymbol,
}

/// A class descriptor plus the name symbol it points at.
pub struct FakeClass {
    klass: Box<FakeKlass>,
    _symbol: Box<FakeSymbol>,
}

impl FakeClass {
    pub fn new(name: &str) -> Self {
        let mut body = [0u8; TYPE_NAME_LEN];
        let n = name.len().min(TYPE_NAME_LEN);
        body[..n].copy_from_slice(&name.as_bytes()[..n]);

        let symbol = Box::new(FakeSymbol {
            _length_and_refcount: name.len() as u64,
            body,
        });
        let klass = Box::new(FakeKlass {
            _layout_helper: 0,
            _super_check_offset: 0,
            name: &*symbol as *const FakeSymbol,
        });
        Self {
            klass,
            _symbol: symbol,
        }
    }

    /// The address the runtime would pass as `KlassHandle`.
    pub fn handle(&self) -> u64 {
        &*self.klass as *const FakeKlass as u64
    }

    /// Register file of a trapped `send_allocation_outside_tlab_event(klass, size)`.
    pub fn outside_tlab(&self, size: u64) -> RegisterContext {
        RegisterContext::new(0, [self.handle(), size, 0, 0, 0, 0])
    }

    /// Register file of a trapped `send_allocation_in_new_tlab_event(klass, tlab, size)`.
    pub fn in_new_tlab(&self, tlab_size: u64, size: u64) -> RegisterContext {
        RegisterContext::new(0, [self.handle(), tlab_size, size, 0, 0, 0])
    }
}

// SAFETY: the raw pointer only ever targets the boxed symbol owned by the same value.
unsafe impl Send for FakeClass {}
unsafe impl Sync for FakeClass {}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_ansi(std::env::var_os("NO_COLOR").is_none())
        .try_init();
}
