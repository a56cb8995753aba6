pub mod slug;
pub mod tail_buf;
