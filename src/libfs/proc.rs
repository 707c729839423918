//! Process context: identity, working directory, and the descriptor
//! table, threaded explicitly through the operation layer.

use std::sync::Arc;

use spin::Mutex;

use crate::kfs::Cred;
use crate::libfs::filetable::FileTable;
use crate::libfs::mnode::Mnode;
use crate::libfs::LibFs;

pub struct Proc {
    pub fs: Arc<LibFs>,
    pub cred: Cred,
    pub cwd: Mutex<Arc<Mnode>>,
    pub ftable: FileTable,
}

impl Proc {
    pub fn new(fs: Arc<LibFs>, cred: Cred) -> Proc {
        let cwd = Mutex::new(fs.root());
        let cpus = fs.cpus();
        Proc {
            fs,
            cred,
            cwd,
            ftable: FileTable::new(cpus),
        }
    }
}
