use campaigner::entry;
use campaigner::error::AppResult;

fn main() -> AppResult<()> {
    entry::run()
}
