//! Core value types shared by the capture and replay sides

pub mod calls;
pub mod handles;
