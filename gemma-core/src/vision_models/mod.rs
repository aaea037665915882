pub mod siglip;
