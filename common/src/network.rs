pub mod filter;
pub mod packet;
