pub mod runner_state;
