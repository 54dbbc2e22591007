pub mod command_router;
pub mod overrides;
pub mod turn;
