// Primitive number types whose byte representation can be reinterpreted freely.
pub trait Align1: bytemuck::Pod {}

impl Align1 for u8 {}
impl Align1 for u16 {}
impl Align1 for u32 {}
impl Align1 for u64 {}
impl Align1 for f32 {}
impl Align1 for f64 {}

// Receive buffers backed by these types keep every payload after the
// header 4 bytes aligned, which is enough for both `f32` and `bf16` views.
pub trait Align4: Align1 {}

impl Align4 for u32 {}
impl Align4 for u64 {}
impl Align4 for f32 {}
impl Align4 for f64 {}
