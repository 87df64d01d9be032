use crate::trm::xfer::Completion;

/// Communication channel (sender) for command completions to the midlayer
pub type CompletionSender = crossbeam_channel::Sender<Completion>;

/// Communication channel (receiver) for command completions to the midlayer
pub type CompletionReceiver = crossbeam_channel::Receiver<Completion>;

pub type Byte = u8;
pub type Long = u32;
