mod blur;
mod compositor;
mod surface;

pub use blur::stack_blur_rgb;
pub use compositor::{Backdrop, BlurBackend, Compositor};
pub use surface::{CompositeOp, Filter, Surface};
