//! In-memory namespace
//!
//! Directory structure and sizes live here; file contents are kept by the
//! backing store and fetched over the mount's stream channel, suspending
//! the request until the store answers.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use umfs::{
    Cookie, Errno, HandlerResult, LengthPrefixed, OpContext, Operation, SetbackFlags,
    UsermountBuilder, VnOp,
};

use crate::backing;

#[derive(Debug)]
struct Inode {
    dir: bool,
    size: u64,
    entries: BTreeMap<Vec<u8>, Cookie>,
}

impl Inode {
    fn new(dir: bool) -> Self {
        Self {
            dir,
            size: 0,
            entries: BTreeMap::new(),
        }
    }
}

/// Namespace plus the channel to the backing store
#[derive(Debug)]
pub struct MemFs {
    inodes: RefCell<HashMap<Cookie, Inode>>,
    next_cookie: Cell<u64>,
    next_frame: Cell<u64>,
    store: RawFd,
}

impl MemFs {
    pub fn new(root: Cookie, store: RawFd) -> Rc<Self> {
        let mut inodes = HashMap::new();
        inodes.insert(root, Inode::new(true));
        Rc::new(Self {
            inodes: RefCell::new(inodes),
            next_cookie: Cell::new(root.0 + 1),
            next_frame: Cell::new(1),
            store,
        })
    }

    /// Register every handler on `builder`
    pub fn install(self: &Rc<Self>, builder: UsermountBuilder) -> UsermountBuilder {
        let fs = self.clone();
        let b = builder.on(Operation::Vn(VnOp::Lookup), move |ctx| fs.lookup(ctx));
        let fs = self.clone();
        let b = b.on(Operation::Vn(VnOp::Create), move |ctx| fs.create(ctx, false));
        let fs = self.clone();
        let b = b.on(Operation::Vn(VnOp::Mkdir), move |ctx| fs.create(ctx, true));
        let fs = self.clone();
        let b = b.on(Operation::Vn(VnOp::Getattr), move |ctx| fs.getattr(ctx));
        let fs = self.clone();
        let b = b.on(Operation::Vn(VnOp::Readdir), move |ctx| fs.readdir(ctx));
        let fs = self.clone();
        let b = b.on(Operation::Vn(VnOp::Read), move |ctx| fs.read(ctx));
        let fs = self.clone();
        let b = b.on(Operation::Vn(VnOp::Write), move |ctx| fs.write(ctx));
        let fs = self.clone();
        let b = b.on(Operation::Vn(VnOp::Remove), move |ctx| fs.remove(ctx));
        let fs = self.clone();
        b.on(Operation::Vn(VnOp::Rename), move |ctx| fs.rename(ctx))
    }

    fn frame_id(&self) -> u64 {
        let id = self.next_frame.get();
        self.next_frame.set(id + 1);
        id
    }

    fn child(&self, dir: Cookie, name: &[u8]) -> Result<Cookie, Errno> {
        let inodes = self.inodes.borrow();
        let parent = inodes.get(&dir).ok_or(Errno::ENOENT)?;
        if !parent.dir {
            return Err(Errno::ENOTDIR);
        }
        parent.entries.get(name).copied().ok_or(Errno::ENOENT)
    }

    fn lookup(&self, ctx: &mut OpContext<'_>) -> HandlerResult {
        let name = ctx.names().ok_or(Errno::EINVAL)?.name.clone();
        let found = self.child(ctx.node(), &name)?;
        ctx.set_new_node(found);
        Ok(())
    }

    fn create(&self, ctx: &mut OpContext<'_>, dir: bool) -> HandlerResult {
        let name = ctx.names().ok_or(Errno::EINVAL)?.name.clone();
        let cookie = Cookie(self.next_cookie.get());
        {
            let mut inodes = self.inodes.borrow_mut();
            let parent = inodes.get_mut(&ctx.node()).ok_or(Errno::ENOENT)?;
            if parent.entries.contains_key(&name) {
                return Err(Errno::EEXIST);
            }
            parent.entries.insert(name, cookie);
            inodes.insert(cookie, Inode::new(dir));
        }
        self.next_cookie.set(cookie.0 + 1);
        tracing::info!(cookie = %cookie, dir, path = ?ctx.path(), "created");
        ctx.set_new_node(cookie);
        ctx.reply(cookie.0.to_le_bytes().to_vec());
        Ok(())
    }

    fn getattr(&self, ctx: &mut OpContext<'_>) -> HandlerResult {
        let inodes = self.inodes.borrow();
        let inode = inodes.get(&ctx.node()).ok_or(Errno::ENOENT)?;
        let mut attr = Vec::with_capacity(9);
        attr.push(u8::from(inode.dir));
        attr.extend_from_slice(&inode.size.to_le_bytes());
        drop(inodes);
        ctx.reply(attr);
        Ok(())
    }

    fn readdir(&self, ctx: &mut OpContext<'_>) -> HandlerResult {
        let inodes = self.inodes.borrow();
        let inode = inodes.get(&ctx.node()).ok_or(Errno::ENOENT)?;
        if !inode.dir {
            return Err(Errno::ENOTDIR);
        }
        let listing = inode
            .entries
            .keys()
            .map(|k| k.as_slice())
            .collect::<Vec<_>>()
            .join(&b'\n');
        drop(inodes);
        ctx.reply(listing);
        Ok(())
    }

    fn read(&self, ctx: &mut OpContext<'_>) -> HandlerResult {
        self.file(ctx.node())?;
        let frame = backing::read_request(self.frame_id(), ctx.node());
        let answer = ctx
            .mount()
            .enqueue_and_suspend(self.store, frame)
            .map_err(|e| e.errno())?;
        ctx.reply(LengthPrefixed::body(&answer).to_vec());
        Ok(())
    }

    fn write(&self, ctx: &mut OpContext<'_>) -> HandlerResult {
        self.file(ctx.node())?;
        let data = ctx.input();
        let frame = backing::write_request(self.frame_id(), ctx.node(), data);
        ctx.mount()
            .enqueue_and_suspend(self.store, frame)
            .map_err(|e| e.errno())?;
        // the inode may be gone by the time the store answers
        if let Some(inode) = self.inodes.borrow_mut().get_mut(&ctx.node()) {
            inode.size = data.len() as u64;
        }
        ctx.reply((data.len() as u64).to_le_bytes().to_vec());
        Ok(())
    }

    fn remove(&self, ctx: &mut OpContext<'_>) -> HandlerResult {
        let name = ctx.names().ok_or(Errno::EINVAL)?.name.clone();
        let target = self.child(ctx.node(), &name)?;
        let mut inodes = self.inodes.borrow_mut();
        if let Some(parent) = inodes.get_mut(&ctx.node()) {
            parent.entries.remove(&name);
        }
        inodes.remove(&target);
        drop(inodes);
        ctx.setback(SetbackFlags::NOREF_N2);
        Ok(())
    }

    fn rename(&self, ctx: &mut OpContext<'_>) -> HandlerResult {
        let names = ctx.names().ok_or(Errno::EINVAL)?;
        let to_dir = names.target_dir.ok_or(Errno::EINVAL)?;
        let to_name = names.target_name.clone().ok_or(Errno::EINVAL)?;
        let moved = self.child(ctx.node(), &names.name)?;

        let mut inodes = self.inodes.borrow_mut();
        if !inodes.get(&to_dir).is_some_and(|d| d.dir) {
            return Err(Errno::ENOTDIR);
        }
        if let Some(from) = inodes.get_mut(&ctx.node()) {
            from.entries.remove(&names.name);
        }
        if let Some(to) = inodes.get_mut(&to_dir) {
            to.entries.insert(to_name, moved);
        }
        drop(inodes);
        tracing::info!(from = ?ctx.path(), to = ?ctx.dest_path(), "renamed");
        Ok(())
    }

    fn file(&self, cookie: Cookie) -> Result<(), Errno> {
        match self.inodes.borrow().get(&cookie) {
            Some(inode) if inode.dir => Err(Errno::EISDIR),
            Some(_) => Ok(()),
            None => Err(Errno::ENOENT),
        }
    }
}
