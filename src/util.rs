pub(crate) use self::{
    head_capture::{HeadCapture, HeadTap},
    prebuffered::Prebuffered,
};

mod head_capture;
mod prebuffered;
