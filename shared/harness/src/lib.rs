mod output;
mod run;

pub use output::{output_filename, write_outputs};
pub use run::{isolate_output, run, truncate_at_newline, RunOptions};
